//! Render engine: device configuration → RGB frame.
//!
//! The [`Renderer`] trait is the seam between the snapshot cache and
//! the browser backend. Production uses [`chromium::ChromiumPool`];
//! tests inject a fake that returns synthetic frames.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::WebInkError;
use crate::registry::Device;

pub mod chromium;

pub use chromium::{ChromiumPool, ChromiumPoolConfig};

/// A tightly packed RGB capture (`width · height · 3` bytes).
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbFrame {
    /// Check the buffer length matches the declared dimensions.
    pub fn validate(&self) -> Result<(), WebInkError> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.data.len() != expected {
            return Err(WebInkError::RenderFailure(format!(
                "frame is {} bytes, expected {} for {}x{}",
                self.data.len(),
                expected,
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

/// Boxed future returned by [`Renderer::render`], so the trait stays
/// object-safe and implementations can move work onto channels.
pub type RenderFuture = Pin<Box<dyn Future<Output = Result<RgbFrame, WebInkError>> + Send>>;

/// Converts a device's page into an RGB buffer of exactly the
/// device's viewport dimensions.
pub trait Renderer: Send + Sync {
    fn render(&self, device: Arc<Device>) -> RenderFuture;
}
