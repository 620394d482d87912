//! webInk core — snapshot pipeline for e-ink display devices.
//!
//! Renders web pages through a headless-browser pool, caches one
//! snapshot per device with single-flight refresh, and slices the
//! cached frame into header-framed PNM tiles. The HTTP and socket
//! front-ends live in `webink-server` and share everything here.

pub mod clients;
pub mod codec;
pub mod error;
pub mod fingerprint;
pub mod logbook;
pub mod mode;
pub mod registry;
pub mod render;
pub mod schedule;
pub mod snapshot;

pub use clients::{ClientActivity, ClientTracker};
pub use codec::{FramePlane, Rect, PALETTE};
pub use error::WebInkError;
pub use fingerprint::{fingerprint, FINGERPRINT_LEN};
pub use logbook::{LogBook, LogEntry};
pub use mode::{ColorMode, DisplayMode};
pub use registry::{Device, DeviceRegistry, Viewport};
pub use render::{ChromiumPool, ChromiumPoolConfig, Renderer, RenderFuture, RgbFrame};
pub use schedule::{QuietHours, RefreshSchedule};
pub use snapshot::{Snapshot, SnapshotCache, SnapshotCacheConfig, SlotStatus};
