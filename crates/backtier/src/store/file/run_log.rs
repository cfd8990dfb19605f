//! File-based run log storage.
//!
//! Stores run records as JSONL files at `{runs_dir}/{job_id}.jsonl`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::history::RunRecord;
use crate::store::error::{StorageError, StorageResult};
use crate::store::run_log::RunLogStore;
use crate::sync::KeyedLocks;

/// Maximum log file size before pruning (1MB).
const MAX_LOG_SIZE: u64 = 1_024 * 1_024;

/// Number of records to keep when pruning.
const ENTRIES_TO_KEEP: usize = 1000;

/// JSONL run log with size-triggered pruning.
#[derive(Clone)]
pub struct FileRunLogStore {
    runs_dir: PathBuf,
    /// Per-job locks serializing access to each file.
    locks: KeyedLocks,
}

impl FileRunLogStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.runs_dir
    }

    fn log_path(&self, job_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{job_id}.jsonl"))
    }

    async fn ensure_dir(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.runs_dir)
            .await
            .map_err(|e| StorageError::file_io(&self.runs_dir, e))
    }

    /// Rewrite a log keeping only the most recent records and the latest
    /// success.
    async fn prune(&self, path: &Path) -> StorageResult<()> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StorageError::file_io(path, e))?;
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= ENTRIES_TO_KEEP {
            return Ok(());
        }

        let cut = lines.len() - ENTRIES_TO_KEEP;
        let mut kept: Vec<&str> = Vec::with_capacity(ENTRIES_TO_KEEP + 1);
        if let Some(i) = lines.iter().rposition(|line| is_success_line(line))
            && i < cut
        {
            kept.push(lines[i]);
        }
        kept.extend_from_slice(&lines[cut..]);

        let new_content = kept.join("\n") + "\n";
        let temp_path = path.with_extension("jsonl.tmp");
        super::atomic_write_file(&temp_path, path, new_content.as_bytes()).await?;

        debug!(
            path = %path.display(),
            before = lines.len(),
            after = kept.len(),
            "Pruned run log"
        );
        Ok(())
    }

    /// Every readable record in a job's log, oldest first. Caller holds the
    /// job lock.
    async fn read_records(&self, job_id: &str) -> StorageResult<Vec<RunRecord>> {
        let path = self.log_path(job_id);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::file_io(&path, e)),
        };

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(record) => records.push(record),
                // A torn final line from a crash is expected; skip it.
                Err(e) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable run record"
                ),
            }
        }
        Ok(records)
    }
}

fn is_success_line(line: &str) -> bool {
    serde_json::from_str::<RunRecord>(line).is_ok_and(|r| r.is_success())
}

#[async_trait]
impl RunLogStore for FileRunLogStore {
    async fn load_recent(&self, job_id: &str, limit: usize) -> StorageResult<Vec<RunRecord>> {
        let lock = self.locks.get(job_id);
        let _guard = lock.lock().await;

        let mut records = self.read_records(job_id).await?;
        let start = records.len().saturating_sub(limit);
        Ok(records.split_off(start))
    }

    async fn load_latest_success(&self, job_id: &str) -> StorageResult<Option<RunRecord>> {
        let lock = self.locks.get(job_id);
        let _guard = lock.lock().await;

        let records = self.read_records(job_id).await?;
        Ok(records.into_iter().rev().find(RunRecord::is_success))
    }

    async fn append(&self, job_id: &str, record: &RunRecord) -> StorageResult<()> {
        let lock = self.locks.get(job_id);
        let _guard = lock.lock().await;

        self.ensure_dir().await?;
        let path = self.log_path(job_id);

        if let Ok(metadata) = fs::metadata(&path).await
            && metadata.len() > MAX_LOG_SIZE
            && let Err(e) = self.prune(&path).await
        {
            warn!(path = %path.display(), error = %e, "Failed to prune run log");
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;

        Ok(())
    }

    async fn delete(&self, job_id: &str) -> StorageResult<()> {
        let lock = self.locks.get(job_id);
        let _guard = lock.lock().await;

        let path = self.log_path(job_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::file_io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{Outcome, RunRecord, Trigger};
    use crate::jobs::Tier;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn record(job_id: &str, ts: i64, outcome: Outcome) -> RunRecord {
        let at = DateTime::<Utc>::from_timestamp(ts, 0).unwrap();
        RunRecord {
            run_id: format!("run-{ts}"),
            job_id: job_id.to_string(),
            tier: Tier::Snapshot,
            trigger: Trigger::Scheduled,
            started_at: at,
            finished_at: at,
            outcome,
            error: None,
            artifact: None,
            attempts: Vec::new(),
        }
    }

    fn create_store(temp_dir: &TempDir) -> FileRunLogStore {
        FileRunLogStore::new(temp_dir.path().join("runs"))
    }

    #[tokio::test]
    async fn append_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);

        store
            .append("snap", &record("snap", 1000, Outcome::Success))
            .await
            .unwrap();
        store
            .append("snap", &record("snap", 2000, Outcome::Failure))
            .await
            .unwrap();

        let records = store.load_recent("snap", 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].run_id, "run-1000");
        assert_eq!(records[1].outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn load_recent_returns_the_tail() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);

        for i in 0..10 {
            store
                .append("snap", &record("snap", i * 1000, Outcome::Success))
                .await
                .unwrap();
        }

        let records = store.load_recent("snap", 3).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].run_id, "run-7000");
        assert_eq!(records[2].run_id, "run-9000");
    }

    #[tokio::test]
    async fn torn_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        store
            .append("snap", &record("snap", 1000, Outcome::Success))
            .await
            .unwrap();

        let path = store.log_path("snap");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"run_id\":\"trunc");
        std::fs::write(&path, content).unwrap();

        let records = store.load_recent("snap", 10).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn missing_log_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        assert!(store.load_recent("nope", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_log_and_tolerates_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);

        store
            .append("snap", &record("snap", 1000, Outcome::Success))
            .await
            .unwrap();
        store.delete("snap").await.unwrap();
        assert!(store.load_recent("snap", 10).await.unwrap().is_empty());

        store.delete("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn prune_keeps_most_recent_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        store.ensure_dir().await.unwrap();

        let path = store.log_path("snap");
        let lines: Vec<String> = (0..(ENTRIES_TO_KEEP as i64 + 5))
            .map(|i| serde_json::to_string(&record("snap", i, Outcome::Success)).unwrap())
            .collect();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        store.prune(&path).await.unwrap();
        let records = store.load_recent("snap", usize::MAX).await.unwrap();
        assert_eq!(records.len(), ENTRIES_TO_KEEP);
        assert_eq!(records[0].run_id, "run-5");
    }

    #[tokio::test]
    async fn latest_success_survives_a_failure_streak() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);

        store
            .append("snap", &record("snap", 1000, Outcome::Success))
            .await
            .unwrap();
        for i in 2..=6 {
            store
                .append("snap", &record("snap", i * 1000, Outcome::Failure))
                .await
                .unwrap();
        }

        let success = store.load_latest_success("snap").await.unwrap().unwrap();
        assert_eq!(success.run_id, "run-1000");
        assert!(store.load_latest_success("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_latest_success_line() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        store.ensure_dir().await.unwrap();

        let path = store.log_path("snap");
        let mut lines = vec![serde_json::to_string(&record("snap", 0, Outcome::Success)).unwrap()];
        lines.extend(
            (1..(ENTRIES_TO_KEEP as i64 + 5))
                .map(|i| serde_json::to_string(&record("snap", i, Outcome::Failure)).unwrap()),
        );
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        store.prune(&path).await.unwrap();
        let records = store.load_recent("snap", usize::MAX).await.unwrap();
        assert_eq!(records.len(), ENTRIES_TO_KEEP + 1);
        assert_eq!(records[0].run_id, "run-0");
        assert_eq!(records[1].run_id, "run-5");
        assert_eq!(
            store.load_latest_success("snap").await.unwrap().unwrap().run_id,
            "run-0"
        );
    }
}
