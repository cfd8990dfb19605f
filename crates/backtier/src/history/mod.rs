//! Run history.
//!
//! An in-memory index of finished runs per job, optionally backed by a
//! [`RunLogStore`]. Records are immutable and shared as `Arc<RunRecord>`;
//! appending swaps a whole record in under a write lock, so concurrent
//! readers see either the old or the new state, never a partial record.

mod record;

pub use record::{
    ArtifactRef, AttemptRecord, ErrorKind, Outcome, RunError, RunRecord, Trigger, new_run_id,
};

// std::sync::RwLock: never held across an await.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::jobs::{JobId, Tier};
use crate::store::{RunLogStore, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub max_records_per_job: usize,
    /// Records older than this are dropped, except a job's latest success.
    pub max_age: chrono::Duration,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_records_per_job: 500,
            max_age: chrono::Duration::days(90),
        }
    }
}

type Index = HashMap<JobId, VecDeque<Arc<RunRecord>>>;

#[derive(Clone)]
pub struct RunHistory {
    records: Arc<RwLock<Index>>,
    store: Option<Arc<dyn RunLogStore>>,
    limits: HistoryLimits,
}

impl RunHistory {
    /// History that lives only in memory.
    pub fn new(limits: HistoryLimits) -> Self {
        Self {
            records: Arc::default(),
            store: None,
            limits,
        }
    }

    /// History persisted through `store`.
    pub fn with_store(store: Arc<dyn RunLogStore>, limits: HistoryLimits) -> Self {
        Self {
            store: Some(store),
            ..Self::new(limits)
        }
    }

    /// Load persisted records for `job_ids`. Returns how many were loaded.
    pub async fn load<'a>(
        &self,
        job_ids: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut loaded = 0;
        for job_id in job_ids {
            let records = store
                .load_recent(job_id, self.limits.max_records_per_job)
                .await?;
            let mut deque: VecDeque<Arc<RunRecord>> =
                records.into_iter().map(Arc::new).collect();
            // The tail can be all failures; dependency checks still need the
            // last success, which predates every record in it.
            if !deque.iter().any(|r| r.is_success())
                && let Some(success) = store.load_latest_success(job_id).await?
            {
                deque.push_front(Arc::new(success));
            }
            prune_job(&mut deque, &self.limits, now);
            loaded += deque.len();
            self.write().insert(job_id.to_string(), deque);
        }
        Ok(loaded)
    }

    /// Persist and publish a finished run.
    ///
    /// A persistence failure is logged; the record is still published so
    /// in-process decisions (dependencies, replication base) stay correct.
    pub async fn append(&self, record: RunRecord) -> Arc<RunRecord> {
        if let Some(store) = &self.store
            && let Err(e) = store.append(&record.job_id, &record).await
        {
            warn!(job_id = %record.job_id, run_id = %record.run_id, error = %e, "Failed to persist run record");
        }

        let record = Arc::new(record);
        let now = record.finished_at;
        let mut index = self.write();
        let deque = index.entry(record.job_id.clone()).or_default();
        deque.push_back(record.clone());
        prune_job(deque, &self.limits, now);
        debug!(job_id = %record.job_id, outcome = record.outcome.as_str(), "Run recorded");
        record
    }

    pub fn latest(&self, job_id: &str) -> Option<Arc<RunRecord>> {
        self.read().get(job_id).and_then(|d| d.back().cloned())
    }

    /// Latest record that is not `skipped`.
    pub fn latest_completed(&self, job_id: &str) -> Option<Arc<RunRecord>> {
        self.find_latest(job_id, |r| r.outcome != Outcome::Skipped)
    }

    pub fn latest_success(&self, job_id: &str) -> Option<Arc<RunRecord>> {
        self.find_latest(job_id, RunRecord::is_success)
    }

    /// Most recently finished success of any job on `tier`.
    pub fn latest_success_in_tier(&self, tier: Tier) -> Option<Arc<RunRecord>> {
        self.read()
            .values()
            .filter_map(|d| d.iter().rev().find(|r| r.tier == tier && r.is_success()))
            .max_by_key(|r| r.finished_at)
            .cloned()
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, job_id: &str, limit: usize) -> Vec<Arc<RunRecord>> {
        self.read()
            .get(job_id)
            .map(|d| d.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_latest(
        &self,
        job_id: &str,
        pred: impl Fn(&RunRecord) -> bool,
    ) -> Option<Arc<RunRecord>> {
        self.read()
            .get(job_id)
            .and_then(|d| d.iter().rev().find(|r| pred(r)).cloned())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.records.read().expect("history lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Index> {
        self.records.write().expect("history lock poisoned")
    }
}

/// Apply count and age limits, keeping the latest success regardless.
fn prune_job(deque: &mut VecDeque<Arc<RunRecord>>, limits: &HistoryLimits, now: DateTime<Utc>) {
    let len = deque.len();
    let cutoff = now - limits.max_age;
    let first_by_count = len.saturating_sub(limits.max_records_per_job);
    let latest_success = deque.iter().rposition(|r| r.is_success());

    if first_by_count == 0 && deque.front().is_none_or(|r| r.finished_at >= cutoff) {
        return;
    }

    let kept: VecDeque<Arc<RunRecord>> = deque
        .iter()
        .enumerate()
        .filter(|(i, r)| {
            Some(*i) == latest_success || (*i >= first_by_count && r.finished_at >= cutoff)
        })
        .map(|(_, r)| r.clone())
        .collect();
    *deque = kept;
}
