//! Control Plane
//!
//! HTTP surface for operators and downstream clients.
//!
//! # Endpoints
//!
//! - `GET /health` - upstream connection and receive loop flags
//! - `GET /status` - full gateway status
//! - `POST /subscribe` - subscribe upstream (connects on demand)
//! - `POST /unsubscribe` - unsubscribe upstream
//! - `GET /cache` - cached records, sorted by symbol (`?limit=N`, default 100)
//! - `GET /cache/{symbol}` - one cached record
//! - `GET /ws` - WebSocket upgrade into a downstream session
//! - `GET /healthz` - liveness probe
//! - `GET /readyz` - readiness probe (ready while upstream is connected)
//! - `GET /metrics` - Prometheus metrics in text format

mod error;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::{ApiError, ApiResult, ErrorResponse};

use crate::application::services::{Gateway, GatewayStatus};
use crate::domain::market::{Symbol, normalize_symbols};
use crate::domain::session::PriceUpdate;
use crate::infrastructure::metrics::get_metrics_handle;

/// Default `limit` for `GET /cache`.
pub const DEFAULT_CACHE_LIMIT: usize = 100;

// =============================================================================
// State
// =============================================================================

/// Shared state for every handler.
#[derive(Debug)]
pub struct ControlPlaneState {
    /// The gateway service.
    pub gateway: Arc<Gateway>,
    /// Build version.
    pub version: String,
    /// Process start.
    pub started_at: Instant,
}

impl ControlPlaneState {
    /// Create handler state.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, version: impl Into<String>) -> Self {
        Self {
            gateway,
            version: version.into(),
            started_at: Instant::now(),
        }
    }
}

/// Build the control plane router.
pub fn router(state: Arc<ControlPlaneState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/subscribe", post(subscribe_handler))
        .route("/unsubscribe", post(unsubscribe_handler))
        .route("/cache", get(cache_list_handler))
        .route("/cache/{symbol}", get(cache_entry_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server for the control plane and session sockets.
pub struct ControlPlaneServer {
    port: u16,
    state: Arc<ControlPlaneState>,
    cancel: CancellationToken,
}

impl ControlPlaneServer {
    /// Create a server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<ControlPlaneState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the server stops unexpectedly.
    pub async fn run(self) -> Result<(), ControlPlaneServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ControlPlaneServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server stops unexpectedly.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ControlPlaneServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "Control plane listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ControlPlaneServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Control plane stopped");
        Ok(())
    }
}

/// Control plane server errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Request / Response Types
// =============================================================================

/// Body of `POST /subscribe` and `POST /unsubscribe`.
#[derive(Debug, Deserialize)]
pub struct SymbolsRequest {
    /// Raw symbols.
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Reply to `POST /subscribe` and `POST /unsubscribe`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolsResponse {
    /// Always `"ok"`.
    pub status: &'static str,
    /// Normalized symbols sent upstream.
    pub symbols: Vec<Symbol>,
    /// Upstream subscription set afterwards.
    pub subscribed_symbols: Vec<Symbol>,
}

/// `GET /health` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Upstream authenticated.
    pub upstream_connected: bool,
    /// Receive loop running.
    pub running: bool,
    /// Build version.
    pub version: String,
    /// Seconds since start.
    pub uptime_secs: u64,
}

/// `GET /cache` query.
#[derive(Debug, Deserialize)]
pub struct CacheQuery {
    /// Maximum entries to return.
    pub limit: Option<usize>,
}

/// `GET /cache` body.
#[derive(Debug, Serialize)]
pub struct CacheListResponse {
    /// Entries returned.
    pub count: usize,
    /// Symbols cached in total.
    pub total: usize,
    /// Records, sorted by symbol.
    pub entries: Vec<PriceUpdate>,
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<ControlPlaneState>>) -> impl IntoResponse {
    let feed = state.gateway.feed();
    Json(HealthResponse {
        upstream_connected: feed.is_connected(),
        running: feed.is_running(),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn status_handler(State(state): State<Arc<ControlPlaneState>>) -> Json<GatewayStatus> {
    Json(state.gateway.status())
}

async fn subscribe_handler(
    State(state): State<Arc<ControlPlaneState>>,
    Json(request): Json<SymbolsRequest>,
) -> ApiResult<Json<SymbolsResponse>> {
    let gateway = &state.gateway;
    let max = gateway.settings().max_symbols_per_request;
    if request.symbols.is_empty() || request.symbols.len() > max {
        return Err(ApiError::BadRequest(format!(
            "symbols must contain between 1 and {max} entries"
        )));
    }
    if normalize_symbols(&request.symbols).is_empty() {
        return Err(ApiError::BadRequest("symbols must not be blank".to_string()));
    }

    gateway.ensure_upstream().await.map_err(|e| {
        tracing::warn!(error = %e, "Upstream connect failed for subscribe request");
        ApiError::ServiceUnavailable(format!("upstream feed unavailable: {e}"))
    })?;

    let symbols = gateway.feed().subscribe(&request.symbols).await?;
    Ok(Json(SymbolsResponse {
        status: "ok",
        symbols,
        subscribed_symbols: gateway.feed().subscribed_symbols(),
    }))
}

async fn unsubscribe_handler(
    State(state): State<Arc<ControlPlaneState>>,
    Json(request): Json<SymbolsRequest>,
) -> ApiResult<Json<SymbolsResponse>> {
    let gateway = &state.gateway;
    if !gateway.feed().is_connected() {
        return Err(ApiError::BadRequest("upstream feed is not connected".to_string()));
    }
    if normalize_symbols(&request.symbols).is_empty() {
        return Err(ApiError::BadRequest("symbols must not be empty".to_string()));
    }

    let symbols = gateway.unsubscribe_upstream(&request.symbols).await?;
    Ok(Json(SymbolsResponse {
        status: "ok",
        symbols,
        subscribed_symbols: gateway.feed().subscribed_symbols(),
    }))
}

async fn cache_entry_handler(
    State(state): State<Arc<ControlPlaneState>>,
    Path(symbol): Path<String>,
) -> ApiResult<Json<PriceUpdate>> {
    let symbol = Symbol::parse(&symbol).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state
        .gateway
        .cache()
        .get(&symbol)
        .map(|record| Json(PriceUpdate::from(record.as_ref())))
        .ok_or_else(|| ApiError::NotFound(format!("no cached data for {symbol}")))
}

async fn cache_list_handler(
    State(state): State<Arc<ControlPlaneState>>,
    Query(query): Query<CacheQuery>,
) -> Json<CacheListResponse> {
    let cache = state.gateway.cache();
    let entries: Vec<PriceUpdate> = cache
        .entries(query.limit.unwrap_or(DEFAULT_CACHE_LIMIT))
        .iter()
        .map(|record| PriceUpdate::from(record.as_ref()))
        .collect();

    Json(CacheListResponse {
        count: entries.len(),
        total: cache.len(),
        entries,
    })
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<ControlPlaneState>>) -> impl IntoResponse {
    if state.gateway.feed().is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}
