//! Headless-Chrome render pool.
//!
//! A fixed number of worker threads each own one headless browser and
//! drain a shared bounded job channel:
//!
//! 1. Acquire: callers enqueue a job; a full queue means every browser
//!    is busy, and the send blocks until one frees up (bounded by the
//!    acquire timeout → [`WebInkError::PoolExhausted`]).
//! 2. Navigate to the device URL, wait for navigation, then give the
//!    page a short settle window for late subresources; navigation is
//!    capped by the hard ceiling.
//! 3. Screenshot the viewport as PNG, decode to tightly packed RGB at
//!    exactly the requested dimensions.
//!
//! A browser that errors is dropped and relaunched before the worker
//! takes its next job, so one crashed renderer never poisons the pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::WebInkError;
use crate::registry::Device;
use crate::render::{Renderer, RenderFuture, RgbFrame};

// ── Config ───────────────────────────────────────────────────────

/// Tuning for [`ChromiumPool`].
#[derive(Debug, Clone)]
pub struct ChromiumPoolConfig {
    /// Number of browser workers.
    pub pool_size: usize,
    /// How long a caller may wait for a free browser.
    pub acquire_timeout: Duration,
    /// Hard ceiling on navigation.
    pub navigation_ceiling: Duration,
    /// Settle window after navigation for in-flight subresources.
    pub settle: Duration,
    /// Extra budget on top of navigation + settle before a worker is
    /// declared unresponsive (covers browser launch and decode).
    pub reply_slack: Duration,
}

impl Default for ChromiumPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            acquire_timeout: Duration::from_secs(30),
            navigation_ceiling: Duration::from_secs(20),
            settle: Duration::from_millis(500),
            reply_slack: Duration::from_secs(15),
        }
    }
}

// ── Pool ─────────────────────────────────────────────────────────

struct RenderJob {
    url: String,
    width: u32,
    height: u32,
    reply: oneshot::Sender<Result<RgbFrame, WebInkError>>,
}

/// The production [`Renderer`]: a pool of headless-Chrome workers fed
/// over a bounded channel.
pub struct ChromiumPool {
    /// `None` once [`shutdown`](Self::shutdown) has closed the queue.
    tx: Mutex<Option<mpsc::Sender<RenderJob>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    config: ChromiumPoolConfig,
}

impl ChromiumPool {
    /// Spawn the worker threads. Browsers launch lazily on the first
    /// job so startup does not pay for idle workers.
    pub fn new(config: ChromiumPoolConfig) -> Self {
        let (tx, rx) = mpsc::channel::<RenderJob>(1);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(config.pool_size);
        for i in 0..config.pool_size.max(1) {
            let rx = Arc::clone(&rx);
            let cfg = config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("chromium-{i}"))
                .spawn(move || worker_loop(rx, cfg))
                .expect("failed to spawn render worker");
            workers.push(handle);
        }

        info!(workers = workers.len(), "chromium render pool started");
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            config,
        }
    }

    /// Close the job channel and join the workers. Each worker
    /// finishes its current job first, so this can take up to one
    /// render budget.
    pub fn shutdown(&self) {
        drop(self.tx.lock().expect("pool sender mutex poisoned").take());
        let workers = std::mem::take(&mut *self.workers.lock().expect("pool worker mutex poisoned"));
        for handle in workers {
            let _ = handle.join();
        }
        info!("chromium render pool stopped");
    }
}

impl Renderer for ChromiumPool {
    fn render(&self, device: Arc<Device>) -> RenderFuture {
        let tx = self
            .tx
            .lock()
            .expect("pool sender mutex poisoned")
            .clone();
        let acquire_timeout = self.config.acquire_timeout;
        let reply_budget =
            self.config.navigation_ceiling + self.config.settle + self.config.reply_slack;

        Box::pin(async move {
            let Some(tx) = tx else {
                return Err(WebInkError::ChannelClosed);
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            let job = RenderJob {
                url: device.source_url.clone(),
                width: device.viewport.width,
                height: device.viewport.height,
                reply: reply_tx,
            };

            match tokio::time::timeout(acquire_timeout, tx.send(job)).await {
                Err(_) => return Err(WebInkError::PoolExhausted(acquire_timeout)),
                Ok(Err(_)) => return Err(WebInkError::ChannelClosed),
                Ok(Ok(())) => {}
            }

            match tokio::time::timeout(reply_budget, reply_rx).await {
                Err(_) => Err(WebInkError::RenderFailure(
                    "render worker did not reply within budget".into(),
                )),
                Ok(Err(_)) => Err(WebInkError::ChannelClosed),
                Ok(Ok(result)) => result,
            }
        })
    }
}

// ── Worker ───────────────────────────────────────────────────────

/// One browser slot. The browser is keyed by the window size it was
/// launched with; a job for a different viewport relaunches it.
struct BrowserSlot {
    browser: Browser,
    size: (u32, u32),
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<RenderJob>>>, cfg: ChromiumPoolConfig) {
    let mut slot: Option<BrowserSlot> = None;

    loop {
        // Hold the receiver lock only while waiting for a job, never
        // while rendering, so the other workers can keep draining.
        let job = {
            let mut rx = rx.lock().expect("render queue mutex poisoned");
            rx.blocking_recv()
        };
        let Some(job) = job else {
            break; // pool shut down
        };

        let result = run_job(&mut slot, &cfg, &job);
        if result.is_err() {
            // Never reuse a browser that produced an error.
            slot = None;
        }
        // A disconnected caller is fine — the frame is simply dropped.
        let _ = job.reply.send(result);
    }
}

fn run_job(
    slot: &mut Option<BrowserSlot>,
    cfg: &ChromiumPoolConfig,
    job: &RenderJob,
) -> Result<RgbFrame, WebInkError> {
    let size = (job.width, job.height);
    if slot.as_ref().map(|s| s.size) != Some(size) {
        *slot = None;
        let browser = launch(size)?;
        *slot = Some(BrowserSlot { browser, size });
    }
    let browser = &slot.as_ref().expect("slot just filled").browser;

    let tab = browser
        .new_tab()
        .map_err(|e| WebInkError::RenderFailure(format!("new tab: {e}")))?;
    tab.set_default_timeout(cfg.navigation_ceiling);

    debug!(url = %job.url, "navigating");
    tab.navigate_to(&job.url)
        .map_err(|e| WebInkError::RenderFailure(format!("navigate: {e}")))?;
    tab.wait_until_navigated()
        .map_err(|e| WebInkError::NavigationTimeout(e.to_string()))?;

    // Settle window for late subresources; the navigation wait only
    // covers the main document.
    std::thread::sleep(cfg.settle);

    let clip = Page::Viewport {
        x: 0.0,
        y: 0.0,
        width: job.width as f64,
        height: job.height as f64,
        scale: 1.0,
    };
    let png = tab
        .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, Some(clip), true)
        .map_err(|e| WebInkError::RenderFailure(format!("screenshot: {e}")))?;

    if let Err(e) = tab.close(true) {
        warn!("failed to close tab: {e}");
    }

    decode_png(&png, job.width, job.height)
}

fn launch(size: (u32, u32)) -> Result<Browser, WebInkError> {
    let options = LaunchOptions::default_builder()
        .headless(true)
        .window_size(Some(size))
        .build()
        .map_err(|e| WebInkError::RenderFailure(format!("launch options: {e}")))?;

    Browser::new(options).map_err(|e| WebInkError::RenderFailure(format!("launch browser: {e}")))
}

/// Decode the screenshot to tightly packed RGB at exactly the
/// requested dimensions; off-size captures are resampled rather than
/// rejected so a device never receives a malformed frame.
fn decode_png(png: &[u8], width: u32, height: u32) -> Result<RgbFrame, WebInkError> {
    let img = image::load_from_memory(png)
        .map_err(|e| WebInkError::RenderFailure(format!("decode screenshot: {e}")))?;

    let rgb = if img.width() == width && img.height() == height {
        img.to_rgb8()
    } else {
        debug!(
            got_w = img.width(),
            got_h = img.height(),
            want_w = width,
            want_h = height,
            "resampling off-size capture"
        );
        img.resize_exact(width, height, image::imageops::FilterType::Lanczos3)
            .to_rgb8()
    };

    let frame = RgbFrame {
        width,
        height,
        data: rgb.into_raw(),
    };
    frame.validate()?;
    Ok(frame)
}
