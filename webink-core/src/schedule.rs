//! Wall-clock refresh scheduling: quiet hours and mandatory refreshes.
//!
//! Devices may carry an optional quiet-hours window during which page
//! refreshes are suppressed (the last snapshot keeps being served), and
//! a list of mandatory refresh times that shorten the reported sleep so
//! the panel wakes up for them.

use chrono::{NaiveTime, Timelike};
use std::time::Duration;

use crate::error::WebInkError;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

// ── QuietHours ───────────────────────────────────────────────────

/// A daily `start`–`end` window; may wrap past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    start: NaiveTime,
    end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse a `"HH:MM"`–`"HH:MM"` pair.
    pub fn parse(start: &str, end: &str) -> Result<Self, WebInkError> {
        Ok(Self {
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    /// Whether `now` falls inside the window.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now <= self.end
        } else {
            // Wraps midnight, e.g. 23:00–06:00.
            now >= self.start || now <= self.end
        }
    }

    /// Seconds from `now` until the window ends (0 if outside it).
    pub fn seconds_until_end(&self, now: NaiveTime) -> u64 {
        if !self.contains(now) {
            return 0;
        }
        seconds_until(now, self.end)
    }

    /// Seconds from `now` until the window next begins.
    pub fn seconds_until_start(&self, now: NaiveTime) -> u64 {
        seconds_until(now, self.start)
    }
}

/// Parse `HH:MM` (strict, 24-hour).
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, WebInkError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| WebInkError::Config(format!("invalid time of day: {s:?} (expected HH:MM)")))
}

/// Seconds from `from` forward to the next occurrence of `to`,
/// wrapping to tomorrow when `to` has already passed.
fn seconds_until(from: NaiveTime, to: NaiveTime) -> u64 {
    let from_s = from.num_seconds_from_midnight() as u64;
    let to_s = to.num_seconds_from_midnight() as u64;
    (to_s + SECONDS_PER_DAY - from_s) % SECONDS_PER_DAY
}

// ── RefreshSchedule ──────────────────────────────────────────────

/// Per-device schedule rules applied to refreshes and reported sleep.
#[derive(Debug, Clone, Default)]
pub struct RefreshSchedule {
    pub quiet_hours: Option<QuietHours>,
    pub mandatory: Vec<NaiveTime>,
}

impl RefreshSchedule {
    /// Whether refreshes are currently suppressed.
    pub fn suppresses(&self, now: NaiveTime) -> bool {
        self.quiet_hours.map(|q| q.contains(now)).unwrap_or(false)
    }

    /// Sleep to report to the device, starting from its configured
    /// `base` duration:
    ///
    /// - inside quiet hours → sleep until the window ends;
    /// - a mandatory refresh sooner than `base` → sleep until it;
    /// - quiet hours starting sooner than `base` → sleep until they
    ///   start (the device then gets the long quiet-hours sleep).
    pub fn sleep_for(&self, now: NaiveTime, base: Duration) -> Duration {
        if let Some(q) = self.quiet_hours {
            if q.contains(now) {
                return Duration::from_secs(q.seconds_until_end(now).max(1));
            }
        }

        let mut sleep = base.as_secs();

        for t in &self.mandatory {
            let until = seconds_until(now, *t);
            if until > 0 && until < sleep {
                sleep = until;
            }
        }

        if let Some(q) = self.quiet_hours {
            let until = q.seconds_until_start(now);
            if until > 0 && until < sleep {
                sleep = until;
            }
        }

        Duration::from_secs(sleep.max(1))
    }
}

// ── Tests ────────────────────────────────────────────────────────
