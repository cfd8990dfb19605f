//! Alert delivery.
//!
//! The orchestrator emits an [`AlertMessage`] on terminal failure, on
//! recovery and optionally on success. Delivery is best-effort: callers log
//! an [`AlertError`] and carry on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::AlertingConfig;
use crate::history::ErrorKind;
use crate::jobs::{JobId, Tier};

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Failure,
    Recovery,
    Success,
}

impl AlertKind {
    fn title(self) -> &'static str {
        match self {
            AlertKind::Failure => "Backup job failed",
            AlertKind::Recovery => "Backup job recovered",
            AlertKind::Success => "Backup job succeeded",
        }
    }

    fn colour(self) -> u32 {
        match self {
            AlertKind::Failure => 0xE7_4C_3C,
            AlertKind::Recovery => 0x2E_CC_71,
            AlertKind::Success => 0x34_98_DB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    pub kind: AlertKind,
    pub job_id: JobId,
    pub job_name: String,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned {status}")]
    Status { status: reqwest::StatusCode },
}

// ============================================================================
// Channels
// ============================================================================

#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, message: &AlertMessage) -> Result<(), AlertError>;
}

/// Which alerts to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    pub enabled: bool,
    pub on_failure: bool,
    pub on_recovery: bool,
    pub on_success: bool,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            on_failure: true,
            on_recovery: true,
            on_success: false,
        }
    }
}

impl From<&AlertingConfig> for AlertPolicy {
    fn from(config: &AlertingConfig) -> Self {
        Self {
            enabled: config.enabled,
            on_failure: config.on_failure,
            on_recovery: config.on_recovery,
            on_success: config.on_success,
        }
    }
}

impl AlertPolicy {
    pub fn allows(&self, kind: AlertKind) -> bool {
        self.enabled
            && match kind {
                AlertKind::Failure => self.on_failure,
                AlertKind::Recovery => self.on_recovery,
                AlertKind::Success => self.on_success,
            }
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn send(&self, message: &AlertMessage) -> Result<(), AlertError> {
        match message.kind {
            AlertKind::Failure => error!(
                job_id = %message.job_id,
                tier = %message.tier,
                error_kind = message.error_kind.map(ErrorKind::as_str).unwrap_or("-"),
                attempts = message.attempts,
                detail = %message.detail,
                "ALERT: backup job failed"
            ),
            kind => info!(
                job_id = %message.job_id,
                tier = %message.tier,
                attempts = message.attempts,
                "ALERT: {}",
                kind.title()
            ),
        }
        Ok(())
    }
}

/// Posts a Discord-compatible embed to a webhook URL.
pub struct WebhookAlertChannel {
    client: reqwest::Client,
    url: String,
    service_name: String,
}

impl WebhookAlertChannel {
    pub fn new(
        url: impl Into<String>,
        service_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            service_name: service_name.into(),
        }
    }

    fn payload(&self, message: &AlertMessage) -> serde_json::Value {
        let mut fields = vec![
            json!({"name": "Job", "value": message.job_id, "inline": true}),
            json!({"name": "Tier", "value": format!("{} ({})", message.tier.id(), message.tier), "inline": true}),
            json!({"name": "Attempts", "value": message.attempts.to_string(), "inline": true}),
        ];
        if let Some(kind) = message.error_kind {
            fields.push(json!({"name": "Error", "value": kind.as_str(), "inline": true}));
        }

        json!({
            "embeds": [{
                "title": format!("{}: {}", message.kind.title(), message.job_name),
                "description": truncate(&message.detail, 2000),
                "color": message.kind.colour(),
                "fields": fields,
                "footer": {"text": self.service_name},
                "timestamp": message.timestamp.to_rfc3339(),
            }]
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    async fn send(&self, message: &AlertMessage) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(message))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status { status });
        }
        debug!(job_id = %message.job_id, kind = ?message.kind, "Alert delivered");
        Ok(())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
