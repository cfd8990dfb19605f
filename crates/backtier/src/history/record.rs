use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::Classification;
use crate::jobs::{JobId, Tier};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Skipped,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Skipped => "skipped",
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Why a run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DependencyUnsatisfied,
    TransientExecutionFailure,
    PermanentExecutionFailure,
    Panicked,
    PreviousRunActive,
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DependencyUnsatisfied => "dependency_unsatisfied",
            ErrorKind::TransientExecutionFailure => "transient_execution_failure",
            ErrorKind::PermanentExecutionFailure => "permanent_execution_failure",
            ErrorKind::Panicked => "panicked",
            ErrorKind::PreviousRunActive => "previous_run_active",
            ErrorKind::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

// ============================================================================
// Artifacts
// ============================================================================

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactRef {
    Snapshot {
        dataset: String,
        name: String,
    },
    Replicated {
        snapshot: String,
        /// Incremental base; absent for a full send or a no-op.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<String>,
        bytes_transferred: u64,
    },
    Synced {
        objects_transferred: u64,
        bytes_transferred: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        objects_in_bucket: Option<u64>,
    },
}

impl ArtifactRef {
    /// The snapshot this replication run left on the remote side.
    pub fn replicated_snapshot(&self) -> Option<&str> {
        match self {
            ArtifactRef::Replicated { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            ArtifactRef::Snapshot { dataset, name } => format!("{dataset}@{name}"),
            ArtifactRef::Replicated {
                snapshot,
                base: Some(base),
                bytes_transferred,
            } => format!("{snapshot} (incremental from {base}, {bytes_transferred} bytes)"),
            ArtifactRef::Replicated {
                snapshot,
                base: None,
                bytes_transferred,
            } => format!("{snapshot} ({bytes_transferred} bytes)"),
            ArtifactRef::Synced {
                objects_transferred,
                bytes_transferred,
                ..
            } => format!("{objects_transferred} objects, {bytes_transferred} bytes"),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub classification: Classification,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// One run of one job, written once when the run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub job_id: JobId,
    pub tier: Tier,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// New run id. ULIDs sort by creation time.
pub fn new_run_id() -> String {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_refs_serialize_with_kind_tag() {
        let artifact = ArtifactRef::Replicated {
            snapshot: "daily-2".to_string(),
            base: None,
            bytes_transferred: 0,
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["kind"], "replicated");
        assert!(json.get("base").is_none());
        assert_eq!(artifact.replicated_snapshot(), Some("daily-2"));
        assert_eq!(artifact.summary(), "daily-2 (0 bytes)");
    }

    #[test]
    fn record_omits_empty_optional_fields() {
        let now = Utc::now();
        let record = RunRecord {
            run_id: new_run_id(),
            job_id: "cloud-sync".to_string(),
            tier: Tier::Cloud,
            trigger: Trigger::Manual,
            started_at: now,
            finished_at: now,
            outcome: Outcome::Skipped,
            error: Some(RunError {
                kind: ErrorKind::PreviousRunActive,
                message: "previous run still active".to_string(),
            }),
            artifact: None,
            attempts: Vec::new(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["tier"], 3);
        assert_eq!(json["error"]["kind"], "previous_run_active");
        assert!(json.get("attempts").is_none());
        assert!(json.get("artifact").is_none());

        let back: RunRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn run_ids_are_unique_and_sortable() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }
}
