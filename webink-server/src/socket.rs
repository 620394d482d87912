//! Framed TCP front-end for low-power embedded clients.
//!
//! A connection carries exactly one request line:
//!
//! ```text
//! webInkV1 <api_key> <device> <mode> <x> <y> <w> <h> <format>\n
//! ```
//!
//! The reply is the same header-framed tile `/get_image` would return,
//! then the connection closes. Any validation or render failure closes
//! the connection with **no bytes written** — firmware treats a bare
//! close as "no update available" and retries after its sleep.
//!
//! The connection cap is enforced by acquiring a semaphore permit
//! *before* `accept`, so a saturated server stalls the accept queue
//! instead of accepting and dropping.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webink_core::codec::Rect;
use webink_core::error::WebInkError;

use crate::{produce_tile, AppState};

/// Mandatory first token of every request line.
pub const PROTOCOL_VERSION: &str = "webInkV1";

/// Longest accepted request line, bytes (including the newline).
const MAX_REQUEST_LINE: usize = 512;

/// Socket front-end tuning.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Maximum concurrently handled connections.
    pub max_connections: usize,
    /// Deadline for receiving the request line.
    pub request_deadline: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            request_deadline: Duration::from_secs(5),
        }
    }
}

/// Accept loop. Runs until `shutdown` fires.
pub async fn run(
    listener: TcpListener,
    state: AppState,
    config: SocketConfig,
    shutdown: CancellationToken,
) {
    let limiter = Arc::new(Semaphore::new(config.max_connections.max(1)));
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        max_connections = config.max_connections,
        "socket server listening"
    );

    loop {
        // Backpressure: hold a permit before accepting.
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = limiter.clone().acquire_owned() => {
                permit.expect("connection semaphore closed")
            }
        };

        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            }
        };

        let state = state.clone();
        let deadline = config.request_deadline;
        tokio::spawn(async move {
            handle_connection(stream, state, deadline).await;
            drop(permit);
        });
    }

    info!("socket server stopped");
}

async fn handle_connection(mut stream: TcpStream, state: AppState, deadline: Duration) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());

    let mut line = String::new();
    {
        // Cap the line so a client cannot buffer unbounded garbage.
        let mut reader = BufReader::new((&mut stream).take(MAX_REQUEST_LINE as u64 + 1));
        match tokio::time::timeout(deadline, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => {}
            Ok(Ok(_)) => return, // closed before sending anything
            Ok(Err(e)) => {
                debug!(peer, "request read failed: {e}");
                return;
            }
            Err(_) => {
                debug!(peer, "request line timed out");
                return;
            }
        }
    }
    if line.len() > MAX_REQUEST_LINE {
        debug!(peer, "request line too long");
        return;
    }

    match serve_request(&state, line.trim_end()).await {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes).await {
                debug!(peer, "write failed: {e}");
                return;
            }
            let _ = stream.shutdown().await;
            debug!(peer, bytes = bytes.len(), "tile sent");
        }
        // Close with no bytes written; the reason stays server-side.
        Err(e) => debug!(peer, error = %e, "request rejected"),
    }
}

/// Parse and serve one request line.
async fn serve_request(state: &AppState, line: &str) -> Result<Vec<u8>, WebInkError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 9 {
        return Err(WebInkError::InvalidBody(format!(
            "expected 9 fields, got {}",
            parts.len()
        )));
    }
    if parts[0] != PROTOCOL_VERSION {
        return Err(WebInkError::InvalidBody(format!(
            "unsupported protocol {:?}",
            parts[0]
        )));
    }

    let coord = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| WebInkError::InvalidBody(format!("bad coordinate {s:?}")))
    };
    let rect = Rect::new(
        coord(parts[4])?,
        coord(parts[5])?,
        coord(parts[6])?,
        coord(parts[7])?,
    );

    let (bytes, _) = produce_tile(state, parts[1], parts[2], parts[3], rect, parts[8]).await?;
    Ok(bytes)
}
