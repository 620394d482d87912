//! Configuration for the webInk server.
//!
//! Loaded from a TOML file selected by `--config` or the
//! `WEBINK_CONFIG_PATH` environment variable. Device definitions live
//! in the same file. Unlike tuning knobs, a file that fails to parse
//! or defines an invalid device aborts startup — serving with a wrong
//! device table is worse than not serving.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use webink_core::error::WebInkError;
use webink_core::mode::ColorMode;
use webink_core::registry::{Device, Viewport};
use webink_core::render::ChromiumPoolConfig;
use webink_core::schedule::{parse_hhmm, QuietHours, RefreshSchedule};
use webink_core::snapshot::SnapshotCacheConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub server: NetworkConfig,
    /// Render engine tuning.
    pub render: RenderConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Registered devices.
    pub devices: Vec<DeviceEntry>,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address both listeners bind to.
    pub bind: String,
    /// HTTP snapshot API port.
    pub http_port: u16,
    /// Framed TCP protocol port.
    pub socket_port: u16,
    /// Maximum concurrently handled socket connections.
    pub max_socket_connections: usize,
    /// Deadline for reading the socket request line, seconds.
    pub socket_request_deadline_s: u64,
}

/// Render engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Number of headless-browser workers.
    pub pool_size: usize,
    /// Wait budget for a free browser, seconds.
    pub acquire_timeout_s: u64,
    /// Hard ceiling on page navigation, seconds.
    pub navigation_ceiling_s: u64,
    /// Post-navigation settle window, milliseconds.
    pub settle_ms: u64,
    /// Extra slack readers grant an in-flight capture, seconds.
    pub capture_wait_slack_s: u64,
    /// Circuit-breaker cool-off after repeated failures, seconds.
    /// Zero disables the breaker.
    pub cool_off_s: u64,
    /// Consecutive failures before the breaker arms.
    pub failure_threshold: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Entries kept per device in the firmware log buffer.
    pub device_log_capacity: usize,
}

/// One `[[devices]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceEntry {
    pub id: String,
    pub api_key: String,
    /// Page the device displays (typically the dashboard renderer).
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Colour mode letter: B, G, R, or C.
    pub color_mode: String,
    pub refresh_interval_s: u64,
    pub sleep_duration_s: u64,
    /// Optional daily window during which refreshes are suppressed.
    pub quiet_hours: Option<QuietHoursEntry>,
    /// `HH:MM` times the device must wake for.
    pub mandatory_refresh: Vec<String>,
}

/// `start`/`end` pair for [`DeviceEntry::quiet_hours`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursEntry {
    pub start: String,
    pub end: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: NetworkConfig::default(),
            render: RenderConfig::default(),
            logging: LoggingConfig::default(),
            devices: vec![DeviceEntry::default()],
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            http_port: 8000,
            socket_port: 8091,
            max_socket_connections: 64,
            socket_request_deadline_s: 5,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            acquire_timeout_s: 30,
            navigation_ceiling_s: 20,
            settle_ms: 500,
            capture_wait_slack_s: 5,
            cool_off_s: 0,
            failure_threshold: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            device_log_capacity: 100,
        }
    }
}

impl Default for DeviceEntry {
    fn default() -> Self {
        Self {
            id: "default".into(),
            api_key: "myapikey".into(),
            url: "http://127.0.0.1:8080/".into(),
            width: 800,
            height: 480,
            color_mode: "B".into(),
            refresh_interval_s: 600,
            sleep_duration_s: 600,
            quiet_hours: None,
            mandatory_refresh: Vec::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file. Parse failures abort
    /// startup (exit non-zero), they are never papered over.
    pub fn load(path: &Path) -> Result<Self, WebInkError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WebInkError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&contents)
            .map_err(|e| WebInkError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Write the default configuration (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::write(path, text)
    }

    pub fn to_pool_config(&self) -> ChromiumPoolConfig {
        ChromiumPoolConfig {
            pool_size: self.render.pool_size.max(1),
            acquire_timeout: Duration::from_secs(self.render.acquire_timeout_s),
            navigation_ceiling: Duration::from_secs(self.render.navigation_ceiling_s),
            settle: Duration::from_millis(self.render.settle_ms),
            ..ChromiumPoolConfig::default()
        }
    }

    /// Readers may wait for the full render budget plus slack.
    pub fn to_cache_config(&self) -> SnapshotCacheConfig {
        let budget = self.render.acquire_timeout_s
            + self.render.navigation_ceiling_s
            + self.render.settle_ms.div_ceil(1000)
            + self.render.capture_wait_slack_s;
        SnapshotCacheConfig {
            wait_cap: Duration::from_secs(budget),
            cool_off: Duration::from_secs(self.render.cool_off_s),
            failure_threshold: self.render.failure_threshold.max(1),
        }
    }

    /// Materialise the device table, validating every entry.
    pub fn build_devices(&self) -> Result<Vec<Device>, WebInkError> {
        self.devices.iter().map(DeviceEntry::to_device).collect()
    }
}

impl DeviceEntry {
    fn to_device(&self) -> Result<Device, WebInkError> {
        if self.id.is_empty() {
            return Err(WebInkError::Config("device id must not be empty".into()));
        }
        if self.api_key.is_empty() {
            return Err(WebInkError::Config(format!(
                "device {:?}: api_key must not be empty",
                self.id
            )));
        }
        if self.url.is_empty() {
            return Err(WebInkError::Config(format!(
                "device {:?}: url must not be empty",
                self.id
            )));
        }

        let mut letters = self.color_mode.chars();
        let color = letters
            .next()
            .filter(|_| letters.next().is_none())
            .and_then(ColorMode::from_letter)
            .ok_or_else(|| {
                WebInkError::Config(format!(
                    "device {:?}: color_mode must be one of B, G, R, C (got {:?})",
                    self.id, self.color_mode
                ))
            })?;

        let quiet_hours = self
            .quiet_hours
            .as_ref()
            .map(|q| QuietHours::parse(&q.start, &q.end))
            .transpose()?;
        let mandatory = self
            .mandatory_refresh
            .iter()
            .map(|s| parse_hhmm(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Device {
            id: self.id.clone(),
            api_key: self.api_key.clone(),
            source_url: self.url.clone(),
            viewport: Viewport {
                width: self.width,
                height: self.height,
            },
            color,
            refresh_interval: Duration::from_secs(self.refresh_interval_s),
            sleep_duration: Duration::from_secs(self.sleep_duration_s),
            schedule: RefreshSchedule {
                quiet_hours,
                mandatory,
            },
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
