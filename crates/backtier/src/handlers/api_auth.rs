//! Bearer token checks for the job API and the admin endpoints.
//!
//! With a token configured, requests need `Authorization: Bearer <token>`.
//! Without one, only loopback peers are accepted.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use crate::server::AppState;

/// Compares digests rather than raw strings so the comparison time does not
/// depend on how much of the token matched.
pub fn is_authorized(token: &Option<String>, addr: &SocketAddr, headers: &HeaderMap) -> bool {
    match token {
        Some(expected) => bearer_token(headers).is_some_and(|provided| {
            Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
        }),
        None => addr.ip().is_loopback(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Middleware for `/api/v1/*`.
pub async fn require_api_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if is_authorized(&state.api_token, &addr, request.headers()) {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}
