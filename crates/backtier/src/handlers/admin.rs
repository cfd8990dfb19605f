//! Admin endpoints.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::info;

use super::api_auth;
use crate::server::AppState;

/// POST /api/admin/v1/shutdown
///
/// Stops the scheduler and the HTTP server. Guarded by `admin_token`, or
/// loopback-only when no token is configured. A second request while the
/// first is in progress gets 409.
pub async fn shutdown(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !api_auth::is_authorized(&state.admin_token, &addr, &headers) {
        return (StatusCode::FORBIDDEN, "Admin access denied").into_response();
    }

    let Some(tx) = state.shutdown_tx.lock().await.take() else {
        return (StatusCode::CONFLICT, "Shutdown already in progress").into_response();
    };

    info!(peer = %addr, "Shutdown requested over admin API");
    let _ = tx.send(());
    (
        StatusCode::OK,
        Json(json!({
            "status": "shutting_down",
            "running_jobs": state
                .scheduler
                .as_ref()
                .map(|s| s.state().running())
                .unwrap_or_default(),
        })),
    )
        .into_response()
}
