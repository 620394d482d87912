//! HTTP front-end: the snapshot API served with axum.
//!
//! | Path            | Method | Purpose                                |
//! |-----------------|--------|----------------------------------------|
//! | `/get_hash`     | GET    | current fingerprint for a device       |
//! | `/get_image`    | GET    | header-framed tile bytes               |
//! | `/get_sleep`    | GET    | seconds the device should sleep        |
//! | `/post_log`     | POST   | firmware log line (UTF-8 body)         |
//! | `/post_metrics` | POST   | firmware telemetry (JSON body)         |
//! | `/api/config`   | GET    | redacted device list, for liveness     |
//! | `/api/clients`  | GET    | client activity table                  |
//!
//! Handlers hold no state beyond parsed parameters; everything
//! delegates to the snapshot cache and friends in [`AppState`].

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use webink_core::codec::Rect;
use webink_core::error::WebInkError;
use webink_core::mode::DisplayMode;

use crate::{produce_tile, AppState};

/// Seconds suggested to clients via `Retry-After` on 503.
const RETRY_AFTER_SECS: u32 = 30;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/get_hash", get(get_hash))
        .route("/get_image", get(get_image))
        .route("/get_sleep", get(get_sleep))
        .route("/post_log", post(post_log))
        .route("/post_metrics", post(post_metrics))
        .route("/api/config", get(api_config))
        .route("/api/clients", get(api_clients))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ── Error mapping ────────────────────────────────────────────────

/// Wrapper mapping [`WebInkError`] onto the HTTP status taxonomy.
struct ApiError(WebInkError);

impl From<WebInkError> for ApiError {
    fn from(e: WebInkError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use WebInkError::*;

        let status = match &self.0 {
            UnknownDevice(_) => StatusCode::NOT_FOUND,
            Unauthorized => StatusCode::UNAUTHORIZED,
            InvalidMode(_) | InvalidRect { .. } | InvalidFormat(_) | InvalidBody(_) => {
                StatusCode::BAD_REQUEST
            }
            ModeConflict { .. } => StatusCode::CONFLICT,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        debug!(status = %status, error = %self.0, "request rejected");
        let mut resp = (status, Json(json!({ "error": self.0.to_string() }))).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        resp
    }
}

// ── Handlers ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HashQuery {
    api_key: String,
    device: String,
    mode: String,
}

async fn get_hash(
    State(state): State<AppState>,
    Query(q): Query<HashQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device = state.registry.authenticate(&q.device, &q.api_key)?;
    let mode: DisplayMode = q.mode.parse()?;
    state.clients.record(&q.device, Some(q.mode.as_str()));

    let configured = device.mode();
    if mode != configured {
        return Err(WebInkError::ModeConflict {
            requested: mode.to_string(),
            configured: configured.to_string(),
        }
        .into());
    }

    let hash = state.cache.hash(&device).await?;
    Ok(Json(json!({ "hash": hash })))
}

#[derive(Deserialize)]
struct ImageQuery {
    api_key: String,
    device: String,
    mode: String,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    format: String,
}

async fn get_image(
    State(state): State<AppState>,
    Query(q): Query<ImageQuery>,
) -> Result<Response, ApiError> {
    let rect = Rect::new(q.x, q.y, q.w, q.h);
    let (bytes, color) =
        produce_tile(&state, &q.api_key, &q.device, &q.mode, rect, &q.format).await?;

    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(color.content_type()))],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize)]
struct DeviceQuery {
    api_key: String,
    device: String,
}

async fn get_sleep(
    State(state): State<AppState>,
    Query(q): Query<DeviceQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device = state.registry.authenticate(&q.device, &q.api_key)?;
    state.clients.record(&q.device, None);

    let now = chrono::Local::now().time();
    let sleep = device.schedule.sleep_for(now, device.sleep_duration);
    Ok(Json(json!({ "sleep": sleep.as_secs() })))
}

async fn post_log(
    State(state): State<AppState>,
    Query(q): Query<DeviceQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.registry.authenticate(&q.device, &q.api_key)?;
    let message = std::str::from_utf8(&body)
        .map_err(|_| WebInkError::InvalidBody("log body is not UTF-8".into()))?;

    debug!(device = %q.device, "firmware log: {message}");
    state.logbook.append(&q.device, message);
    state.clients.record(&q.device, None);
    Ok(StatusCode::NO_CONTENT)
}

async fn post_metrics(
    State(state): State<AppState>,
    Query(q): Query<DeviceQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.registry.authenticate(&q.device, &q.api_key)?;
    let metrics: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| WebInkError::InvalidBody(format!("metrics body is not JSON: {e}")))?;

    state.clients.record_metrics(&q.device, metrics);
    Ok(StatusCode::NO_CONTENT)
}

/// Redacted device list joined with per-slot liveness. No api_keys.
async fn api_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.cache.status();
    let mut registered: Vec<_> = state.registry.devices().collect();
    registered.sort_by(|a, b| a.id.cmp(&b.id));

    let devices: Vec<serde_json::Value> = registered
        .into_iter()
        .map(|d| {
            let slot = status.iter().find(|s| s.device == d.id);
            json!({
                "id": d.id,
                "url": d.source_url,
                "mode": d.mode().to_string(),
                "refresh_interval_s": d.refresh_interval.as_secs(),
                "sleep_duration_s": d.sleep_duration.as_secs(),
                "has_snapshot": slot.map(|s| s.has_snapshot).unwrap_or(false),
                "fingerprint": slot.and_then(|s| s.fingerprint.clone()),
                "last_error": slot.and_then(|s| s.last_error.clone()),
            })
        })
        .collect();

    Json(json!({ "devices": devices }))
}

async fn api_clients(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.clients.snapshot()).unwrap_or_else(|_| json!({})))
}
