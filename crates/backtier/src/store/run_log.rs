//! Run log storage trait.

use async_trait::async_trait;

use super::error::StorageResult;
use crate::history::RunRecord;

/// Append-only log of run records, one log per job.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    /// Up to `limit` most recent records, oldest first.
    async fn load_recent(&self, job_id: &str, limit: usize) -> StorageResult<Vec<RunRecord>>;

    /// The job's most recent successful record, however far back.
    async fn load_latest_success(&self, job_id: &str) -> StorageResult<Option<RunRecord>>;

    async fn append(&self, job_id: &str, record: &RunRecord) -> StorageResult<()>;

    /// Remove a job's log. Missing logs are not an error.
    async fn delete(&self, job_id: &str) -> StorageResult<()>;
}
