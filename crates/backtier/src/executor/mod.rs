//! Tier executors.
//!
//! Each executor performs one tier's unit of work through its abstract
//! store or transport and classifies the outcome. Executors never retry;
//! the orchestrator owns retry, retention and alerting.

mod cloud;
mod replication;
mod snapshot;

pub use cloud::CloudExecutor;
pub use replication::ReplicationExecutor;
pub use snapshot::SnapshotExecutor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::{ArtifactRef, RunRecord};
use crate::jobs::{JobDescriptor, Tier};
use crate::retention::Artifact;
use crate::sync::ArtifactPins;
use crate::transport::{SnapshotRef, SnapshotStore, TransportError};

// ============================================================================
// Result types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::TransientFailure => "transient_failure",
            Classification::PermanentFailure => "permanent_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorResult {
    pub artifact: Option<ArtifactRef>,
    pub classification: Classification,
    pub detail: String,
}

impl ExecutorResult {
    pub fn success(artifact: ArtifactRef) -> Self {
        Self {
            detail: artifact.summary(),
            artifact: Some(artifact),
            classification: Classification::Success,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            artifact: None,
            classification: Classification::TransientFailure,
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            artifact: None,
            classification: Classification::PermanentFailure,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.classification == Classification::Success
    }
}

// ============================================================================
// Context
// ============================================================================

/// Everything an executor needs to know about the attempt it is running.
pub struct ExecutionContext<'a> {
    pub job: &'a JobDescriptor,
    pub run_id: &'a str,
    /// 1-based attempt number.
    pub attempt: u32,
    pub now: DateTime<Utc>,
    /// This job's latest successful run, if any.
    pub last_success: Option<Arc<RunRecord>>,
    pub pins: ArtifactPins,
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait TierExecutor: Send + Sync {
    fn tier(&self) -> Tier;

    async fn run(&self, ctx: &ExecutionContext<'_>) -> ExecutorResult;

    /// The dated artifact set retention prunes after a success, if the tier has one.
    fn retention_target(&self) -> Option<Arc<dyn RetentionTarget>> {
        None
    }
}

/// A dated artifact set that can be listed and pruned.
#[async_trait]
pub trait RetentionTarget: Send + Sync {
    /// Tier whose pins protect these artifacts.
    fn tier(&self) -> Tier;

    async fn artifacts(&self) -> Result<Vec<Artifact>, TransportError>;

    async fn delete(&self, artifact: &Artifact) -> Result<(), TransportError>;
}

/// Executors keyed by tier.
#[derive(Clone, Default)]
pub struct Executors {
    by_tier: HashMap<Tier, Arc<dyn TierExecutor>>,
}

impl Executors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, executor: Arc<dyn TierExecutor>) -> Self {
        self.by_tier.insert(executor.tier(), executor);
        self
    }

    pub fn get(&self, tier: Tier) -> Option<&Arc<dyn TierExecutor>> {
        self.by_tier.get(&tier)
    }
}

// ============================================================================
// Snapshot-backed retention target
// ============================================================================

/// Snapshots of one dataset that carry a `{label}-{YYYYmmdd-HHMMSS}` name.
///
/// Snapshots without that shape were not made by this service and are
/// never offered to retention.
pub struct DatasetSnapshots {
    store: Arc<dyn SnapshotStore>,
    dataset: String,
    tier: Tier,
}

impl DatasetSnapshots {
    pub fn new(store: Arc<dyn SnapshotStore>, dataset: impl Into<String>, tier: Tier) -> Self {
        Self {
            store,
            dataset: dataset.into(),
            tier,
        }
    }
}

#[async_trait]
impl RetentionTarget for DatasetSnapshots {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn artifacts(&self) -> Result<Vec<Artifact>, TransportError> {
        Ok(self
            .store
            .list(&self.dataset)
            .await?
            .into_iter()
            .filter(|s| is_managed_name(&s.name))
            .map(|s| Artifact::new(s.name, s.created_at))
            .collect())
    }

    async fn delete(&self, artifact: &Artifact) -> Result<(), TransportError> {
        let snapshot = SnapshotRef::new(&self.dataset, &artifact.id, artifact.created_at);
        self.store.destroy(&snapshot).await
    }
}

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Snapshot name for `label` at `at`.
pub fn snapshot_name(label: &str, at: DateTime<Utc>) -> String {
    format!("{label}-{}", at.format(TIMESTAMP_FORMAT))
}

fn is_managed_name(name: &str) -> bool {
    let Some(split) = name.len().checked_sub(15) else {
        return false;
    };
    match (name.get(..split), name.get(split..)) {
        (Some(head), Some(stamp)) => {
            head.len() > 1
                && head.ends_with('-')
                && chrono::NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_ok()
        }
        _ => false,
    }
}
