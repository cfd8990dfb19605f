use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::build_info::{BuildInfo, SERVICE_NAME, VERSION};
use crate::server::AppState;
use crate::status::JobStatus;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: BuildInfo,
    pub uptime_seconds: u64,
    pub heartbeat_seconds: u64,
    pub scheduler_started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub scheduler_stale: bool,
    pub jobs: Vec<JobStatus>,
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.status.snapshot();
    Json(StatusResponse {
        status: if snapshot.healthy { "healthy" } else { "unhealthy" },
        version: BuildInfo::new(),
        uptime_seconds: state.uptime().as_secs(),
        heartbeat_seconds: state.heartbeat_seconds,
        scheduler_started_at: snapshot.scheduler.started_at,
        last_heartbeat: snapshot.scheduler.last_tick,
        scheduler_stale: snapshot.scheduler.stale,
        jobs: snapshot.jobs,
    })
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

/// GET /
pub async fn index() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: SERVICE_NAME,
        version: VERSION,
        endpoints: vec![
            "GET /health",
            "GET /status",
            "GET /livez",
            "GET /version",
            "GET /api/v1/jobs/{job_id}/runs",
            "POST /api/v1/jobs/{job_id}/run",
            "POST /api/admin/v1/shutdown",
        ],
    })
}
