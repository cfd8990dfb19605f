//! Job API: run history and manual triggers.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::problem_details;
use crate::history::RunRecord;
use crate::scheduler::{SchedulerError, TriggerOutcome};
use crate::server::AppState;

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RunsResponse {
    pub job_id: String,
    pub runs: Vec<RunRecord>,
}

/// GET /api/v1/jobs/{job_id}/runs
///
/// Most recent run records, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    query: Result<Query<RunsQuery>, QueryRejection>,
) -> Response {
    if state.status.registry().get(&job_id).is_none() {
        return problem_details::not_found(format!("job '{job_id}' not found")).into_response();
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return problem_details::bad_request(rejection.body_text()).into_response();
        }
    };

    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    if limit == 0 || limit > MAX_RUNS_LIMIT {
        return problem_details::bad_request(format!(
            "limit must be between 1 and {MAX_RUNS_LIMIT}"
        ))
        .into_response();
    }

    let runs = state
        .history
        .recent(&job_id, limit)
        .iter()
        .map(|r| r.as_ref().clone())
        .collect();
    Json(RunsResponse { job_id, runs }).into_response()
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// POST /api/v1/jobs/{job_id}/run
///
/// Dispatches the job under the same execution lock as scheduled fires.
/// Returns 409 when a run is already in flight (a `skipped` record is
/// written), 503 when the scheduler is not running or shutting down.
pub async fn trigger_run(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let Some(scheduler) = state.scheduler.as_ref() else {
        return problem_details::service_unavailable("scheduler is not running").into_response();
    };

    match scheduler.trigger_now(&job_id) {
        Ok(TriggerOutcome::Dispatched { run_id }) => {
            info!(job_id = %job_id, run_id = %run_id, "Manual run dispatched");
            (
                StatusCode::ACCEPTED,
                Json(TriggerResponse {
                    status: "dispatched",
                    run_id: Some(run_id),
                }),
            )
                .into_response()
        }
        Ok(TriggerOutcome::Skipped) => (
            StatusCode::CONFLICT,
            Json(TriggerResponse {
                status: "skipped",
                run_id: None,
            }),
        )
            .into_response(),
        Err(SchedulerError::NotFound(_)) => {
            problem_details::not_found(format!("job '{job_id}' not found")).into_response()
        }
        Err(SchedulerError::ShuttingDown) => {
            problem_details::service_unavailable("scheduler is shutting down").into_response()
        }
    }
}
