use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    Classification, DatasetSnapshots, ExecutionContext, ExecutorResult, RetentionTarget,
    TierExecutor,
};
use crate::history::ArtifactRef;
use crate::jobs::Tier;
use crate::transport::{SnapshotRef, SnapshotStore, TransportError, TransportErrorKind};

/// Sends the newest local snapshot to the remote store.
///
/// The last replicated snapshot comes from the job's latest successful run,
/// not from the remote side. When it is still present locally it is used as
/// the incremental base.
pub struct ReplicationExecutor {
    local: Arc<dyn SnapshotStore>,
    remote: Arc<dyn SnapshotStore>,
    source_dataset: String,
    target_dataset: String,
    /// Only snapshots whose name starts with `{filter}-` are replicated.
    snapshot_filter: Option<String>,
}

impl ReplicationExecutor {
    pub fn new(
        local: Arc<dyn SnapshotStore>,
        remote: Arc<dyn SnapshotStore>,
        source_dataset: impl Into<String>,
        target_dataset: impl Into<String>,
    ) -> Self {
        Self {
            local,
            remote,
            source_dataset: source_dataset.into(),
            target_dataset: target_dataset.into(),
            snapshot_filter: None,
        }
    }

    pub fn with_snapshot_filter(mut self, filter: impl Into<String>) -> Self {
        self.snapshot_filter = Some(filter.into());
        self
    }

    fn eligible(&self, snapshot: &SnapshotRef) -> bool {
        match &self.snapshot_filter {
            Some(filter) => snapshot
                .name
                .strip_prefix(filter.as_str())
                .is_some_and(|rest| rest.starts_with('-')),
            None => true,
        }
    }

    fn failed(&self, error: TransportError) -> ExecutorResult {
        match classify(&error) {
            Classification::PermanentFailure => ExecutorResult::permanent(error.to_string()),
            _ => ExecutorResult::transient(error.to_string()),
        }
    }
}

/// Credentials and destination problems need an operator; the network does not.
fn classify(error: &TransportError) -> Classification {
    match error.kind {
        TransportErrorKind::Auth
        | TransportErrorKind::Permission
        | TransportErrorKind::InvalidDestination
        | TransportErrorKind::StoreFull
        | TransportErrorKind::StoreDegraded => Classification::PermanentFailure,
        _ => Classification::TransientFailure,
    }
}

#[async_trait]
impl TierExecutor for ReplicationExecutor {
    fn tier(&self) -> Tier {
        Tier::Replication
    }

    async fn run(&self, ctx: &ExecutionContext<'_>) -> ExecutorResult {
        let snapshots = match self.local.list(&self.source_dataset).await {
            Ok(snapshots) => snapshots,
            Err(e) => return self.failed(e),
        };
        let Some(latest) = snapshots.iter().filter(|s| self.eligible(s)).max() else {
            return ExecutorResult::permanent(format!(
                "no local snapshot of {} to replicate",
                self.source_dataset
            ));
        };

        let last_replicated = ctx
            .last_success
            .as_ref()
            .and_then(|r| r.artifact.as_ref())
            .and_then(ArtifactRef::replicated_snapshot);

        if last_replicated == Some(latest.name.as_str()) {
            debug!(job_id = %ctx.job.id, snapshot = %latest.name, "Snapshot already replicated");
            return ExecutorResult::success(ArtifactRef::Replicated {
                snapshot: latest.name.clone(),
                base: None,
                bytes_transferred: 0,
            });
        }

        let base = last_replicated
            .and_then(|name| snapshots.iter().find(|s| s.name == name))
            .filter(|base| *base < latest);

        // Keep both ends of the send out of local retention while it runs.
        let _latest_pin = ctx.pins.pin(Tier::Snapshot, &latest.name);
        let _base_pin = base.map(|b| ctx.pins.pin(Tier::Snapshot, &b.name));

        let stream = match self.local.send(latest, base).await {
            Ok(stream) => stream,
            Err(e) => return self.failed(e),
        };
        let bytes = match self.remote.receive(stream, &self.target_dataset).await {
            Ok(bytes) => bytes,
            Err(e) => return self.failed(e),
        };

        info!(
            job_id = %ctx.job.id,
            snapshot = %latest.name,
            base = base.map(|b| b.name.as_str()).unwrap_or("-"),
            remote = self.remote.endpoint(),
            bytes,
            "Snapshot replicated"
        );
        ExecutorResult::success(ArtifactRef::Replicated {
            snapshot: latest.name.clone(),
            base: base.map(|b| b.name.clone()),
            bytes_transferred: bytes,
        })
    }

    fn retention_target(&self) -> Option<Arc<dyn RetentionTarget>> {
        Some(Arc::new(DatasetSnapshots::new(
            self.remote.clone(),
            &self.target_dataset,
            Tier::Replication,
        )))
    }
}
