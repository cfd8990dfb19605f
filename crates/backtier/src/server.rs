use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::sync::{Mutex, oneshot};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::handlers;
use crate::history::RunHistory;
use crate::scheduler::SchedulerHandle;
use crate::status::StatusReporter;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub status: StatusReporter,
    pub history: RunHistory,
    pub scheduler: Option<SchedulerHandle>,
    pub admin_token: Option<String>,
    pub api_token: Option<String>,
    pub heartbeat_seconds: u64,
    pub started_at: Instant,
    pub shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

// ============================================================================
// Server Setup
// ============================================================================

/// Create a shutdown channel pair.
///
/// Returns (sender for AppState, receiver for shutdown_signal).
pub fn shutdown_channel() -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
    oneshot::channel()
}

pub fn build_app(
    state: AppState,
    request_timeout_seconds: u64,
    max_connections: usize,
) -> Router {
    let api_v1 = Router::new()
        .route("/jobs/{job_id}/runs", get(handlers::list_runs))
        .route("/jobs/{job_id}/run", post(handlers::trigger_run))
        .with_state(state.clone())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_seconds),
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            handlers::api_auth::require_api_token,
        ))
        .layer(ConcurrencyLimitLayer::new(max_connections));

    // Admin routes (no timeout, state required for shutdown)
    let admin_routes = Router::new()
        .route("/shutdown", post(handlers::shutdown))
        .with_state(state.clone());

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/livez", get(handlers::livez))
        .route("/version", get(handlers::version))
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_seconds),
        ))
        .nest("/api/v1", api_v1)
        .nest("/api/admin/v1", admin_routes)
}
