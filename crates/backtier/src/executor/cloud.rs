use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Classification, ExecutionContext, ExecutorResult, TierExecutor};
use crate::history::ArtifactRef;
use crate::jobs::Tier;
use crate::transport::{CloudTransport, TransportError, TransportErrorKind};

/// Mirrors a local tree into an object-storage bucket.
pub struct CloudExecutor {
    transport: Arc<dyn CloudTransport>,
    local_path: PathBuf,
    bucket: String,
}

impl CloudExecutor {
    pub fn new(
        transport: Arc<dyn CloudTransport>,
        local_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            local_path: local_path.into(),
            bucket: bucket.into(),
        }
    }
}

fn classify(error: &TransportError) -> Classification {
    match error.kind {
        TransportErrorKind::Quota
        | TransportErrorKind::Permission
        | TransportErrorKind::Auth
        | TransportErrorKind::InvalidDestination
        | TransportErrorKind::NotFound
        | TransportErrorKind::StoreFull => Classification::PermanentFailure,
        TransportErrorKind::RateLimited
        | TransportErrorKind::Connectivity
        | TransportErrorKind::Timeout
        | TransportErrorKind::StoreDegraded
        | TransportErrorKind::Other => Classification::TransientFailure,
    }
}

#[async_trait]
impl TierExecutor for CloudExecutor {
    fn tier(&self) -> Tier {
        Tier::Cloud
    }

    async fn run(&self, ctx: &ExecutionContext<'_>) -> ExecutorResult {
        let stats = match self.transport.sync(&self.local_path, &self.bucket).await {
            Ok(stats) => stats,
            Err(e) => {
                return match classify(&e) {
                    Classification::PermanentFailure => ExecutorResult::permanent(e.to_string()),
                    _ => ExecutorResult::transient(e.to_string()),
                };
            }
        };

        // The object count is informational; a failed listing does not fail the sync.
        let objects_in_bucket = match self.transport.list(&self.bucket).await {
            Ok(objects) => Some(objects.len() as u64),
            Err(e) => {
                warn!(job_id = %ctx.job.id, bucket = %self.bucket, error = %e, "Failed to list bucket after sync");
                None
            }
        };

        info!(
            job_id = %ctx.job.id,
            bucket = %self.bucket,
            objects = stats.objects_transferred,
            bytes = stats.bytes_transferred,
            "Cloud sync finished"
        );
        ExecutorResult::success(ArtifactRef::Synced {
            objects_transferred: stats.objects_transferred,
            bytes_transferred: stats.bytes_transferred,
            objects_in_bucket,
        })
    }
}
