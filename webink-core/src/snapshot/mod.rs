//! Snapshot cache: per-device frames with single-flight refresh.
//!
//! Each registered device owns one slot holding the most recent
//! capture. The slot is a small state machine:
//!
//! - **fresh** → serve the held snapshot directly;
//! - **stale / empty, idle** → the arriving reader starts a capture
//!   (detached, so a disconnecting client never abandons it) and then
//!   waits like everyone else;
//! - **stale, capture in flight** → readers register as waiters and
//!   are woken when the capture installs or fails.
//!
//! Replacement is atomic: the slot stores an `Arc<Snapshot>`, so a
//! reader sees either the whole old frame or the whole new one. On
//! failure the previous snapshot is retained; the error is delivered
//! to every current waiter and the next stale read re-arms a capture.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::codec::{FramePlane, Rect};
use crate::error::WebInkError;
use crate::fingerprint::fingerprint;
use crate::mode::DisplayMode;
use crate::registry::{Device, DeviceRegistry};
use crate::render::{Renderer, RgbFrame};

// ── Snapshot ─────────────────────────────────────────────────────

/// The most recent capture for one device.
///
/// Holds both the raw RGB buffer (hashed, and the source of truth)
/// and the mode-prepared plane, so tile reads never re-run the
/// dither and stay byte-identical across slices.
#[derive(Debug)]
pub struct Snapshot {
    pub mode: DisplayMode,
    pub rgb: Vec<u8>,
    pub plane: FramePlane,
    pub fingerprint: String,
    pub captured_at: Instant,
}

impl Snapshot {
    fn is_fresh(&self, interval: Duration) -> bool {
        self.captured_at.elapsed() < interval
    }
}

// ── Config ───────────────────────────────────────────────────────

/// Tuning for [`SnapshotCache`].
#[derive(Debug, Clone)]
pub struct SnapshotCacheConfig {
    /// How long a reader may wait on an in-flight capture. Should be
    /// the render engine's total budget plus slack.
    pub wait_cap: Duration,
    /// Cool-off window after repeated failures; zero disables the
    /// circuit breaker.
    pub cool_off: Duration,
    /// Consecutive failures before the cool-off arms.
    pub failure_threshold: u32,
}

impl Default for SnapshotCacheConfig {
    fn default() -> Self {
        Self {
            wait_cap: Duration::from_secs(55),
            cool_off: Duration::ZERO,
            failure_threshold: 3,
        }
    }
}

// ── Slot ─────────────────────────────────────────────────────────

#[derive(Default)]
struct SlotState {
    current: Option<Arc<Snapshot>>,
    in_flight: bool,
    /// Bumped once per completed capture, success or failure, so
    /// waiters can tell a real completion from a spurious wake.
    epoch: u64,
    /// Message of the most recent failed capture; cleared on success.
    last_error: Option<String>,
    failure_streak: u32,
    cooling_until: Option<Instant>,
}

struct DeviceSlot {
    state: Mutex<SlotState>,
    capture_done: Notify,
}

impl DeviceSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            capture_done: Notify::new(),
        }
    }
}

/// Liveness view of one slot for `/api/config`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotStatus {
    pub device: String,
    pub has_snapshot: bool,
    pub fingerprint: Option<String>,
    pub age_seconds: Option<u64>,
    pub last_error: Option<String>,
}

// ── SnapshotCache ────────────────────────────────────────────────

/// One slot per registered device, sharing a single render engine.
pub struct SnapshotCache {
    renderer: Arc<dyn Renderer>,
    slots: HashMap<String, DeviceSlot>,
    config: SnapshotCacheConfig,
}

/// Outcome of one lock-scoped look at a [`DeviceSlot`], computed by
/// [`decide_step`].
enum SnapshotStep<'a> {
    /// Resolved: return this to the caller of [`SnapshotCache::snapshot`].
    Ready(Result<Arc<Snapshot>, WebInkError>),
    /// The slot was idle; the caller should spawn a capture and retry.
    StartCapture,
    /// A capture is in flight; await this (already armed) notification.
    Wait(Pin<Box<dyn Future<Output = ()> + Send + 'a>>),
}

/// Lock `slot`, resolve the current situation against `watched`, and
/// release the lock before returning. Kept as a plain function (no
/// `async`, so the `MutexGuard` it holds never becomes part of an
/// `async fn`'s generator state) purely so the compiler can see that
/// the guard cannot outlive any `.await` in the caller.
fn decide_step<'a>(
    slot: &'a DeviceSlot,
    device: &Device,
    watched: &mut Option<u64>,
) -> SnapshotStep<'a> {
    let mut st = slot.state.lock().expect("slot mutex poisoned");

    if let Some(epoch) = *watched {
        if st.epoch != epoch {
            // The capture we were waiting on finished.
            if let Some(err) = &st.last_error {
                return SnapshotStep::Ready(Err(WebInkError::RenderFailure(err.clone())));
            }
            if let Some(snap) = &st.current {
                return SnapshotStep::Ready(Ok(Arc::clone(snap)));
            }
            *watched = None;
        }
    }

    if let Some(snap) = &st.current {
        let suppressed = device.schedule.suppresses(chrono::Local::now().time());
        if suppressed || snap.is_fresh(device.refresh_interval) {
            return SnapshotStep::Ready(Ok(Arc::clone(snap)));
        }
    }

    if !st.in_flight {
        if let Some(until) = st.cooling_until {
            if Instant::now() < until {
                let msg = st
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "repeated capture failures".into());
                return SnapshotStep::Ready(Err(WebInkError::CoolingOff(msg)));
            }
            st.cooling_until = None;
        }

        *watched = Some(st.epoch);
        st.in_flight = true;
        return SnapshotStep::StartCapture;
    }

    // Register on the notifier while still holding the lock, so a
    // completion between unlock and await cannot be missed.
    *watched = Some(st.epoch);
    let mut notified: Pin<Box<Notified<'a>>> = Box::pin(slot.capture_done.notified());
    notified.as_mut().enable();
    SnapshotStep::Wait(notified)
}

impl SnapshotCache {
    /// Build a cache with one empty slot per device in `registry`.
    pub fn new(
        renderer: Arc<dyn Renderer>,
        registry: &DeviceRegistry,
        config: SnapshotCacheConfig,
    ) -> Self {
        let slots = registry
            .devices()
            .map(|d| (d.id.clone(), DeviceSlot::new()))
            .collect();
        Self {
            renderer,
            slots,
            config,
        }
    }

    /// Return the current snapshot for `device`, capturing one first
    /// if the slot is empty or stale (single-flight).
    ///
    /// During the device's quiet hours a held snapshot is served
    /// without refreshing regardless of age.
    pub async fn snapshot(
        self: &Arc<Self>,
        device: &Arc<Device>,
    ) -> Result<Arc<Snapshot>, WebInkError> {
        let slot = self
            .slots
            .get(device.id.as_str())
            .ok_or_else(|| WebInkError::UnknownDevice(device.id.clone()))?;

        let deadline = Instant::now() + self.config.wait_cap;
        // Epoch of the capture this reader is waiting on, if any.
        // Keyed on the epoch (not `in_flight`) so a capture that
        // completes between loop iterations is still consumed instead
        // of re-armed.
        let mut watched: Option<u64> = None;

        loop {
            // The lock-holding decision is made in a plain (non-async)
            // function so the `MutexGuard` never appears as a local in
            // this generator's state, which is what an `await` inside
            // a `loop` needs for the compiler to prove the future is
            // `Send` even though the guard is always dropped well
            // before any `.await`.
            match decide_step(slot, device, &mut watched) {
                SnapshotStep::Ready(result) => return result,
                SnapshotStep::StartCapture => {
                    // Detached: the capture outlives a disconnecting
                    // reader, and every waiter shares its result.
                    let cache = Arc::clone(self);
                    let dev = Arc::clone(device);
                    tokio::spawn(async move { cache.run_capture(dev).await });
                    continue;
                }
                SnapshotStep::Wait(mut notified) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WebInkError::RenderFailure(
                            "timed out waiting for in-flight capture".into(),
                        ));
                    }
                    if tokio::time::timeout(deadline - now, notified.as_mut())
                        .await
                        .is_err()
                    {
                        return Err(WebInkError::RenderFailure(
                            "timed out waiting for in-flight capture".into(),
                        ));
                    }
                    // Loop re-locks and resolves against `watched`.
                }
            }
        }
    }

    /// The current fingerprint, refreshing under the same rules as
    /// [`snapshot`](Self::snapshot).
    pub async fn hash(self: &Arc<Self>, device: &Arc<Device>) -> Result<String, WebInkError> {
        Ok(self.snapshot(device).await?.fingerprint.clone())
    }

    /// Produce the header-framed tile for `rect`.
    ///
    /// The requested mode must match the device's configured mode and
    /// the format token must match the mode's encoding; both are
    /// checked before any capture is triggered. An unknown token is a
    /// validation error; a known token for the wrong mode (`pgm` on a
    /// mono device) is a mode conflict.
    pub async fn tile(
        self: &Arc<Self>,
        device: &Arc<Device>,
        mode: &DisplayMode,
        rect: Rect,
        format: &str,
    ) -> Result<Vec<u8>, WebInkError> {
        let configured = device.mode();
        if *mode != configured {
            return Err(WebInkError::ModeConflict {
                requested: mode.to_string(),
                configured: configured.to_string(),
            });
        }
        if !matches!(format, "pbm" | "pgm" | "ppm") {
            return Err(WebInkError::InvalidFormat(format.to_string()));
        }
        if format != mode.color.format_token() {
            return Err(WebInkError::ModeConflict {
                requested: format.to_string(),
                configured: mode.color.format_token().to_string(),
            });
        }
        rect.validate(mode.width, mode.height)?;

        let snap = self.snapshot(device).await?;
        if snap.mode != *mode {
            return Err(WebInkError::ModeConflict {
                requested: mode.to_string(),
                configured: snap.mode.to_string(),
            });
        }
        snap.plane.encode_tile(rect)
    }

    /// Per-device liveness rows, sorted by id.
    pub fn status(&self) -> Vec<SlotStatus> {
        let mut rows: Vec<SlotStatus> = self
            .slots
            .iter()
            .map(|(id, slot)| {
                let st = slot.state.lock().expect("slot mutex poisoned");
                SlotStatus {
                    device: id.clone(),
                    has_snapshot: st.current.is_some(),
                    fingerprint: st.current.as_ref().map(|s| s.fingerprint.clone()),
                    age_seconds: st
                        .current
                        .as_ref()
                        .map(|s| s.captured_at.elapsed().as_secs()),
                    last_error: st.last_error.clone(),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.device.cmp(&b.device));
        rows
    }

    // ── Capture ──────────────────────────────────────────────────

    async fn run_capture(self: Arc<Self>, device: Arc<Device>) {
        let started = Instant::now();
        let result = self
            .renderer
            .render(Arc::clone(&device))
            .await
            .and_then(|frame| build_snapshot(&device, frame));

        let Some(slot) = self.slots.get(device.id.as_str()) else {
            return;
        };
        let mut st = slot.state.lock().expect("slot mutex poisoned");
        st.in_flight = false;
        st.epoch = st.epoch.wrapping_add(1);

        match result {
            Ok(snapshot) => {
                info!(
                    device = %device.id,
                    fingerprint = %snapshot.fingerprint,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "snapshot installed"
                );
                st.current = Some(Arc::new(snapshot));
                st.last_error = None;
                st.failure_streak = 0;
                st.cooling_until = None;
            }
            Err(e) => {
                warn!(device = %device.id, error = %e, "capture failed");
                st.last_error = Some(e.to_string());
                st.failure_streak += 1;
                if !self.config.cool_off.is_zero()
                    && st.failure_streak >= self.config.failure_threshold
                {
                    debug!(device = %device.id, "capture cool-off armed");
                    st.cooling_until = Some(Instant::now() + self.config.cool_off);
                }
            }
        }
        drop(st);
        slot.capture_done.notify_waiters();
    }
}

/// Prepare a captured frame into an installable [`Snapshot`].
fn build_snapshot(device: &Device, frame: RgbFrame) -> Result<Snapshot, WebInkError> {
    frame.validate()?;
    if frame.width != device.viewport.width || frame.height != device.viewport.height {
        return Err(WebInkError::RenderFailure(format!(
            "renderer produced {}x{}, viewport is {}x{}",
            frame.width, frame.height, device.viewport.width, device.viewport.height
        )));
    }

    let mode = device.mode();
    let plane = FramePlane::prepare(&frame.data, &mode)?;
    let digest = fingerprint(&frame.data, &mode.to_string(), &device.id);

    Ok(Snapshot {
        mode,
        rgb: frame.data,
        plane,
        fingerprint: digest,
        captured_at: Instant::now(),
    })
}

// ── Tests ────────────────────────────────────────────────────────
