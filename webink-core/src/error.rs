//! Domain-specific error types for the webInk snapshot server.
//!
//! All fallible operations return `Result<T, WebInkError>`.
//! No panics on invalid input — every error is typed and recoverable,
//! and the front-ends map variants onto HTTP statuses or a silent
//! connection close.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the snapshot server core.
#[derive(Debug, Error)]
pub enum WebInkError {
    // ── Client validation ────────────────────────────────────────
    /// The device id is not present in the registry.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The API key did not match the device's configured key.
    #[error("invalid api key")]
    Unauthorized,

    /// A display-mode string did not parse or violated the
    /// bits/colour consistency rule.
    #[error("invalid display mode: {0}")]
    InvalidMode(String),

    /// A requested tile rectangle falls outside the frame.
    #[error("invalid rect {x},{y} {w}x{h} for {frame_w}x{frame_h} frame")]
    InvalidRect {
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        frame_w: u32,
        frame_h: u32,
    },

    /// The output format token does not match the display mode.
    #[error("invalid format token: {0}")]
    InvalidFormat(String),

    /// A request line or body was malformed.
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    // ── Consistency ──────────────────────────────────────────────
    /// The requested mode differs from the device's configured mode.
    #[error("mode conflict: requested {requested}, device is {configured}")]
    ModeConflict {
        requested: String,
        configured: String,
    },

    // ── Transient render ─────────────────────────────────────────
    /// Page navigation did not settle within the hard ceiling.
    #[error("navigation timeout: {0}")]
    NavigationTimeout(String),

    /// The browser failed while rendering (crash, bad screenshot,
    /// decode failure).
    #[error("render failure: {0}")]
    RenderFailure(String),

    /// No browser context became available within the wait budget.
    #[error("render pool exhausted after {0:?}")]
    PoolExhausted(Duration),

    /// A capture is still cooling off after repeated failures.
    #[error("capture suppressed for cool-off: {0}")]
    CoolingOff(String),

    // ── Plumbing ─────────────────────────────────────────────────
    /// An mpsc/oneshot channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The TCP/IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ── Fatal ────────────────────────────────────────────────────
    /// Configuration could not be parsed or is internally
    /// inconsistent. Aborts startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WebInkError {
    /// Whether this error is a transient render-side failure that a
    /// client should retry after its sleep interval.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WebInkError::NavigationTimeout(_)
                | WebInkError::RenderFailure(_)
                | WebInkError::PoolExhausted(_)
                | WebInkError::CoolingOff(_)
                | WebInkError::ChannelClosed
        )
    }
}
