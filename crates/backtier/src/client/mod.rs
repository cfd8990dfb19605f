//! HTTP client for a running backtier daemon.
//!
//! Used by the `status` and `stop` CLI commands.

mod error;

pub use error::{ClientError, Result};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

/// Body of `GET /health`. Returned for both 200 and 503.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub failing_jobs: Vec<String>,
    #[serde(default)]
    pub scheduler_stale: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub service: String,
    pub version: String,
    #[serde(default)]
    pub commit: String,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusReport {
    pub status: String,
    pub version: VersionInfo,
    pub uptime_seconds: u64,
    pub heartbeat_seconds: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduler_stale: bool,
    pub jobs: Vec<JobReport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobReport {
    pub id: String,
    pub name: String,
    pub tier: u8,
    pub cadence: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub running: bool,
}

/// Result of `POST /api/v1/jobs/{job_id}/run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResult {
    Dispatched { run_id: String },
    Skipped,
}

#[derive(Deserialize)]
struct TriggerBody {
    run_id: Option<String>,
}

/// HTTP client for a backtier daemon.
#[derive(Debug, Clone)]
pub struct BacktierClient {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl BacktierClient {
    /// Example: `BacktierClient::new("http://localhost:8080")`
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            http: Client::new(),
        }
    }

    /// Bearer token sent with API and admin requests.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// GET /health. A 503 is a valid answer and is returned as a report.
    pub async fn health(&self) -> Result<HealthReport> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            Ok(response.json().await?)
        } else {
            Err(self.parse_error(response).await)
        }
    }

    /// GET /status
    pub async fn status(&self) -> Result<StatusReport> {
        let url = format!("{}/status", self.base_url);
        let response = self.http.get(&url).send().await?;
        self.json_response(response).await
    }

    /// POST /api/v1/jobs/{job_id}/run
    pub async fn trigger(&self, job_id: &str) -> Result<TriggerResult> {
        let url = format!("{}/api/v1/jobs/{}/run", self.base_url, job_id);
        let response = self.authorized(self.http.post(&url)).send().await?;

        match response.status() {
            reqwest::StatusCode::CONFLICT => Ok(TriggerResult::Skipped),
            s if s.is_success() => {
                let body: TriggerBody = response.json().await?;
                Ok(TriggerResult::Dispatched {
                    run_id: body.run_id.unwrap_or_default(),
                })
            }
            _ => Err(self.parse_error(response).await),
        }
    }

    /// POST /api/admin/v1/shutdown
    pub async fn shutdown(&self) -> Result<()> {
        let url = format!("{}/api/admin/v1/shutdown", self.base_url);
        let response = self.authorized(self.http.post(&url)).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.parse_error(response).await)
        }
    }

    // ----------------------------------------------------------------------------
    // Helpers
    // ----------------------------------------------------------------------------

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn parse_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        let message = match serde_json::from_str::<ProblemDetails>(&body) {
            Ok(problem) => problem.detail.unwrap_or(problem.title),
            Err(_) if !body.trim().is_empty() => body.trim().to_string(),
            Err(_) => format!("HTTP {status}"),
        };
        ClientError::ApiError { status, message }
    }

    async fn json_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(self.parse_error(response).await)
        }
    }
}

/// RFC 7807 Problem Details response.
#[derive(Deserialize)]
struct ProblemDetails {
    title: String,
    detail: Option<String>,
}
