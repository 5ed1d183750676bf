//! Dashboard HTTP server.
//!
//! Serves production progress for the configured line as point-in-time JSON
//! and as Server-Sent Event streams. Streams send one event as soon as the
//! client connects and another whenever the shared [`ChangeWatcher`]
//! publishes a snapshot that differs from what the client last received.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/data` | Overall progress `{count, percentage, line_name, target}` |
//! | `GET`  | `/stream` | SSE stream of overall progress |
//! | `GET`  | `/visual-data` | Per-segment progress `{labels, actual_counts, target_counts, line_name, segments}` |
//! | `GET`  | `/visual-stream` | SSE stream of per-segment progress |
//! | `POST` | `/config/reload` | Re-read the configuration file and republish |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Metric reads never produce error responses: if the partition cannot be
//! read the pull endpoints return the empty snapshot and the streams stay
//! quiet for that cycle.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so dashboards can be
//! served from anywhere on the shop-floor network.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::hub::StreamHub;
use crate::metrics::{FeedKind, MetricsService};
use crate::models::SegmentView;
use crate::watcher::ChangeWatcher;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    configs: Arc<ConfigStore>,
    hub: Arc<StreamHub>,
}

impl AppState {
    pub fn new(configs: Arc<ConfigStore>, clock: Arc<dyn Clock>) -> Self {
        let service = Arc::new(MetricsService::new(configs.clone(), clock));
        Self {
            configs,
            hub: Arc::new(StreamHub::new(service)),
        }
    }

    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }
}

/// Builds the router without binding it, so tests can serve it on an
/// ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/data", get(handle_data))
        .route("/stream", get(handle_stream))
        .route("/visual-data", get(handle_visual_data))
        .route("/visual-stream", get(handle_visual_stream))
        .route("/config/reload", post(handle_reload))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the change watcher and serves the dashboard API on
/// `[server].bind` until the process is terminated.
pub async fn run_server(configs: Arc<ConfigStore>, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    let config = configs.snapshot();
    let state = AppState::new(configs, clock);

    let watcher = ChangeWatcher::new(
        state.hub.clone(),
        Duration::from_millis(config.watcher.poll_interval_ms),
    );
    tokio::spawn(watcher.run());

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, line = %config.line.name, "dashboard server listening");
    axum::serve(listener, router(state)).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============ Pull endpoints ============

async fn pull(state: &AppState, kind: FeedKind) -> Json<serde_json::Value> {
    let service = state.hub.service().clone();
    let feeds = match tokio::task::spawn_blocking(move || service.compute_or_default()).await {
        Ok(feeds) => feeds,
        Err(_) => state.hub.service().empty(),
    };
    Json(feeds.to_value(kind))
}

/// Handler for `GET /data`.
async fn handle_data(State(state): State<AppState>) -> Json<serde_json::Value> {
    pull(&state, FeedKind::Overall).await
}

/// Handler for `GET /visual-data`.
async fn handle_visual_data(State(state): State<AppState>) -> Json<serde_json::Value> {
    pull(&state, FeedKind::Segmented).await
}

// ============ Streams ============

async fn stream(state: AppState, kind: FeedKind) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = state.hub.subscribe(kind).await;
    let events = session
        .into_stream()
        .map(|payload| Ok(Event::default().data(payload)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Handler for `GET /stream`.
async fn handle_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    stream(state, FeedKind::Overall).await
}

/// Handler for `GET /visual-stream`.
async fn handle_visual_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    stream(state, FeedKind::Segmented).await
}

// ============ POST /config/reload ============

#[derive(Serialize)]
struct ReloadResponse {
    line_name: String,
    target: u32,
    segments: Vec<SegmentView>,
}

/// Handler for `POST /config/reload`.
///
/// On success the new configuration is applied to the next recomputation,
/// which is published right away. On failure the previous configuration
/// stays active.
async fn handle_reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, AppError> {
    let config = state.configs.reload().map_err(|e| AppError {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        code: "reload_failed".to_string(),
        message: format!("{:#}", e),
    })?;

    let service = state.hub.service().clone();
    if let Ok(Ok(feeds)) = tokio::task::spawn_blocking(move || service.compute()).await {
        state.hub.publish(feeds);
    }

    Ok(Json(ReloadResponse {
        line_name: config.line.name.clone(),
        target: config.line.target,
        segments: config.time_segments().iter().map(SegmentView::from).collect(),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
