//! Device registry: the read-only map from device id to configuration.
//!
//! Built once at startup from the configuration file and never mutated
//! afterwards, so lookups need no locking. Authentication failures are
//! logged with per-device rate limiting so a misconfigured panel in a
//! retry loop cannot flood the log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::WebInkError;
use crate::mode::{ColorMode, DisplayMode};
use crate::schedule::RefreshSchedule;

/// Minimum interval between warn-level auth-failure log lines per
/// device id; failures in between are logged at debug.
const AUTH_WARN_INTERVAL: Duration = Duration::from_secs(10);

// ── Device ───────────────────────────────────────────────────────

/// Viewport dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A registered display device.
#[derive(Debug, Clone)]
pub struct Device {
    /// Opaque unique id, as used in request parameters.
    pub id: String,
    /// Shared secret for this device.
    pub api_key: String,
    /// Page the device displays.
    pub source_url: String,
    pub viewport: Viewport,
    pub color: ColorMode,
    /// Snapshot freshness window.
    pub refresh_interval: Duration,
    /// Base sleep reported by `/get_sleep`.
    pub sleep_duration: Duration,
    pub schedule: RefreshSchedule,
}

impl Device {
    /// The device's canonical display mode.
    pub fn mode(&self) -> DisplayMode {
        DisplayMode::new(self.viewport.width, self.viewport.height, self.color)
    }
}

// ── DeviceRegistry ───────────────────────────────────────────────

/// Process-wide device table.
pub struct DeviceRegistry {
    devices: HashMap<String, Arc<Device>>,
    /// Last warn-level auth-failure log per device id.
    auth_warned: Mutex<HashMap<String, Instant>>,
}

impl DeviceRegistry {
    /// Build the registry, validating ids and viewports.
    pub fn new(devices: Vec<Device>) -> Result<Self, WebInkError> {
        let mut map = HashMap::with_capacity(devices.len());
        for device in devices {
            if device.id.is_empty() {
                return Err(WebInkError::Config("device id must not be empty".into()));
            }
            if device.viewport.width == 0 || device.viewport.height == 0 {
                return Err(WebInkError::Config(format!(
                    "device {:?}: viewport must be non-zero",
                    device.id
                )));
            }
            let id = device.id.clone();
            if map.insert(id.clone(), Arc::new(device)).is_some() {
                return Err(WebInkError::Config(format!("duplicate device id: {id:?}")));
            }
        }
        Ok(Self {
            devices: map,
            auth_warned: Mutex::new(HashMap::new()),
        })
    }

    /// Look up a device by id.
    pub fn lookup(&self, id: &str) -> Result<Arc<Device>, WebInkError> {
        self.devices
            .get(id)
            .cloned()
            .ok_or_else(|| WebInkError::UnknownDevice(id.to_string()))
    }

    /// Look up a device and check its API key in constant time.
    ///
    /// A bad key on a known device and a lookup of an unknown device
    /// both count as failures, but only the former is rate-limit
    /// logged here (the unknown id is surfaced to the caller).
    pub fn authenticate(&self, id: &str, api_key: &str) -> Result<Arc<Device>, WebInkError> {
        let device = self.lookup(id)?;
        if constant_time_eq(device.api_key.as_bytes(), api_key.as_bytes()) {
            Ok(device)
        } else {
            self.log_auth_failure(id);
            Err(WebInkError::Unauthorized)
        }
    }

    /// All registered devices, in unspecified order.
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn log_auth_failure(&self, id: &str) {
        let mut warned = self.auth_warned.lock().expect("auth log mutex poisoned");
        let now = Instant::now();
        match warned.get(id) {
            Some(last) if now.duration_since(*last) < AUTH_WARN_INTERVAL => {
                debug!(device = id, "rejected api key");
            }
            _ => {
                warned.insert(id.to_string(), now);
                warn!(device = id, "rejected api key");
            }
        }
    }
}

/// Compare two byte strings without short-circuiting on the first
/// mismatch. The length difference is folded into the accumulator so
/// unequal lengths fail without an early return.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    let n = a.len().min(b.len());
    for i in 0..n {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

// ── Tests ────────────────────────────────────────────────────────
