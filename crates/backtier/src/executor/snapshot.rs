use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{
    Classification, DatasetSnapshots, ExecutionContext, ExecutorResult, RetentionTarget,
    TierExecutor, snapshot_name,
};
use crate::history::ArtifactRef;
use crate::jobs::Tier;
use crate::transport::{SnapshotStore, TransportError, TransportErrorKind};

/// Creates a dated snapshot of one dataset.
pub struct SnapshotExecutor {
    store: Arc<dyn SnapshotStore>,
    dataset: String,
}

impl SnapshotExecutor {
    pub fn new(store: Arc<dyn SnapshotStore>, dataset: impl Into<String>) -> Self {
        Self {
            store,
            dataset: dataset.into(),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

/// Full or degraded pools need an operator; so does a bad dataset name.
fn classify(error: &TransportError) -> Classification {
    match error.kind {
        TransportErrorKind::StoreFull
        | TransportErrorKind::Quota
        | TransportErrorKind::StoreDegraded
        | TransportErrorKind::InvalidDestination
        | TransportErrorKind::NotFound
        | TransportErrorKind::Auth
        | TransportErrorKind::Permission => Classification::PermanentFailure,
        _ => Classification::TransientFailure,
    }
}

#[async_trait]
impl TierExecutor for SnapshotExecutor {
    fn tier(&self) -> Tier {
        Tier::Snapshot
    }

    async fn run(&self, ctx: &ExecutionContext<'_>) -> ExecutorResult {
        let label = ctx.job.label.as_deref().unwrap_or(&ctx.job.id);
        let name = snapshot_name(label, ctx.now);
        debug!(job_id = %ctx.job.id, dataset = %self.dataset, snapshot = %name, "Creating snapshot");

        match self.store.create(&self.dataset, &name).await {
            Ok(snapshot) => ExecutorResult::success(ArtifactRef::Snapshot {
                dataset: snapshot.dataset,
                name: snapshot.name,
            }),
            Err(e) => match classify(&e) {
                Classification::PermanentFailure => ExecutorResult::permanent(e.to_string()),
                _ => ExecutorResult::transient(e.to_string()),
            },
        }
    }

    fn retention_target(&self) -> Option<Arc<dyn RetentionTarget>> {
        Some(Arc::new(DatasetSnapshots::new(
            self.store.clone(),
            &self.dataset,
            Tier::Snapshot,
        )))
    }
}
