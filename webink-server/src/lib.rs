//! webInk server — HTTP and socket front-ends over the snapshot core.
//!
//! Both protocols resolve requests through [`produce_tile`], so the
//! bytes a client receives are identical regardless of transport.

use std::sync::Arc;

use webink_core::clients::ClientTracker;
use webink_core::codec::Rect;
use webink_core::error::WebInkError;
use webink_core::logbook::LogBook;
use webink_core::mode::{ColorMode, DisplayMode};
use webink_core::registry::DeviceRegistry;
use webink_core::snapshot::SnapshotCache;

pub mod config;
pub mod http;
pub mod socket;

pub use config::ServerConfig;

/// Shared handles passed to both front-ends.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub cache: Arc<SnapshotCache>,
    pub logbook: Arc<LogBook>,
    pub clients: Arc<ClientTracker>,
}

/// Authenticate, resolve the device, and produce the header-framed
/// tile for one request. The single code path behind both
/// `/get_image` and the socket protocol.
pub async fn produce_tile(
    state: &AppState,
    api_key: &str,
    device_id: &str,
    mode_str: &str,
    rect: Rect,
    format: &str,
) -> Result<(Vec<u8>, ColorMode), WebInkError> {
    let device = state.registry.authenticate(device_id, api_key)?;
    let mode: DisplayMode = mode_str.parse()?;
    state.clients.record(device_id, Some(mode_str));

    let bytes = state.cache.tile(&device, &mode, rect, format).await?;
    Ok((bytes, mode.color))
}
