//! Bounded per-device log buffers for firmware-submitted messages.
//!
//! `/post_log` appends here; the buffers are in-memory only and each
//! device keeps at most `capacity` entries (oldest dropped first).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Longest accepted message; anything larger is truncated.
const MAX_MESSAGE_LEN: usize = 4096;

/// A single firmware log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub received_at: DateTime<Utc>,
    pub message: String,
}

/// Per-device ring buffers of firmware log messages.
pub struct LogBook {
    capacity: usize,
    inner: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl LogBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Append a message for `device`, evicting the oldest entry when
    /// the buffer is full.
    pub fn append(&self, device: &str, message: &str) {
        let mut message = message.to_string();
        if message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }

        let mut inner = self.inner.lock().expect("log book mutex poisoned");
        let buf = inner.entry(device.to_string()).or_default();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(LogEntry {
            received_at: Utc::now(),
            message,
        });
    }

    /// Snapshot of the entries for `device`, oldest first.
    pub fn entries(&self, device: &str) -> Vec<LogEntry> {
        let inner = self.inner.lock().expect("log book mutex poisoned");
        inner
            .get(device)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of stored entries for `device`.
    pub fn len(&self, device: &str) -> usize {
        let inner = self.inner.lock().expect("log book mutex poisoned");
        inner.get(device).map(|b| b.len()).unwrap_or(0)
    }
}
