//! HTTP request handlers.

mod admin;
pub mod api_auth;
mod health;
mod jobs;
pub(crate) mod problem_details;
mod status;
mod version;

pub use admin::shutdown;
pub use health::{HealthResponse, health, livez};
pub use jobs::{RunsQuery, RunsResponse, TriggerResponse, list_runs, trigger_run};
pub use status::{ServiceInfo, StatusResponse, index, status};
pub use version::version;
