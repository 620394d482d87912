//! In-memory client activity tracking.
//!
//! Every authenticated request updates the calling device's record;
//! `/api/clients` exposes the table so an operator can see which
//! panels are alive, how often they call, and what they last reported.
//! Nothing here is persisted across restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Activity record for one device.
#[derive(Debug, Clone, Serialize)]
pub struct ClientActivity {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Total requests across both protocols.
    pub requests: u64,
    /// Mode string from the most recent request that carried one.
    pub last_mode: Option<String>,
    /// Most recent telemetry document from `/post_metrics`.
    pub last_metrics: Option<serde_json::Value>,
}

/// Tracks per-device request activity.
#[derive(Default)]
pub struct ClientTracker {
    inner: Mutex<HashMap<String, ClientActivity>>,
}

impl ClientTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request from `device`, optionally noting its mode.
    pub fn record(&self, device: &str, mode: Option<&str>) {
        let mut inner = self.inner.lock().expect("client tracker mutex poisoned");
        let now = Utc::now();
        let entry = inner
            .entry(device.to_string())
            .or_insert_with(|| ClientActivity {
                first_seen: now,
                last_seen: now,
                requests: 0,
                last_mode: None,
                last_metrics: None,
            });
        entry.last_seen = now;
        entry.requests += 1;
        if let Some(mode) = mode {
            entry.last_mode = Some(mode.to_string());
        }
    }

    /// Attach a telemetry document to the device's record.
    pub fn record_metrics(&self, device: &str, metrics: serde_json::Value) {
        self.record(device, None);
        let mut inner = self.inner.lock().expect("client tracker mutex poisoned");
        if let Some(entry) = inner.get_mut(device) {
            entry.last_metrics = Some(metrics);
        }
    }

    /// Cloned, id-sorted view of the table for serialisation.
    pub fn snapshot(&self) -> BTreeMap<String, ClientActivity> {
        let inner = self.inner.lock().expect("client tracker mutex poisoned");
        inner
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let tracker = ClientTracker::new();
        tracker.record("dev1", Some("800x480x1xB"));
        tracker.record("dev1", None);
        tracker.record("dev2", None);

        let snap = tracker.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["dev1"].requests, 2);
        assert_eq!(snap["dev1"].last_mode.as_deref(), Some("800x480x1xB"));
        assert_eq!(snap["dev2"].requests, 1);
    }

    #[test]
    fn metrics_attach_and_count() {
        let tracker = ClientTracker::new();
        tracker.record_metrics("dev1", serde_json::json!({"battery": 87}));
        let snap = tracker.snapshot();
        assert_eq!(snap["dev1"].requests, 1);
        assert_eq!(snap["dev1"].last_metrics.as_ref().unwrap()["battery"], 87);
    }
}
