use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::jobs::JobId;
use crate::server::AppState;

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_jobs: Option<Vec<JobId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_stale: Option<bool>,
}

/// GET /health
///
/// 200 while every job's latest completed run succeeded and the scheduler
/// loop is ticking; 503 with the offending jobs otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.status.health();
    if health.healthy {
        return (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy".to_string(),
                failing_jobs: None,
                scheduler_stale: None,
            }),
        );
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthResponse {
            status: "unhealthy".to_string(),
            failing_jobs: Some(health.failing_jobs),
            scheduler_stale: Some(health.scheduler_stale),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_livez() {
        let (status, body) = livez().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[test]
    fn healthy_body_omits_details() {
        let body = HealthResponse {
            status: "healthy".to_string(),
            failing_jobs: None,
            scheduler_stale: None,
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"status":"healthy"}"#
        );
    }
}
