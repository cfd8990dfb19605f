//! Process-scoped scheduler state, shared read-only with the status reporter.

// std::sync::RwLock: never held across an await.
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

use crate::history::Trigger;
use crate::jobs::JobId;

/// Scheduling view of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobState {
    pub next_run_at: Option<DateTime<Utc>>,
    /// Set while a run holds the job's execution lock.
    pub running_since: Option<DateTime<Utc>>,
    pub current_run_id: Option<String>,
    pub current_trigger: Option<Trigger>,
}

#[derive(Debug)]
pub struct SchedulerState {
    jobs: RwLock<HashMap<JobId, JobState>>,
    /// Milliseconds since the epoch of the loop's last wake; 0 before the first.
    last_tick_ms: AtomicI64,
    started_at: DateTime<Utc>,
}

impl SchedulerState {
    pub fn new<'a>(job_ids: impl IntoIterator<Item = &'a str>, started_at: DateTime<Utc>) -> Self {
        Self {
            jobs: RwLock::new(
                job_ids
                    .into_iter()
                    .map(|id| (id.to_string(), JobState::default()))
                    .collect(),
            ),
            last_tick_ms: AtomicI64::new(0),
            started_at,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn tick(&self, now: DateTime<Utc>) {
        self.last_tick_ms.store(now.timestamp_millis(), Ordering::Release);
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        match self.last_tick_ms.load(Ordering::Acquire) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn job(&self, job_id: &str) -> Option<JobState> {
        self.read().get(job_id).cloned()
    }

    pub fn next_run_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.read().get(job_id).and_then(|s| s.next_run_at)
    }

    pub fn set_next_run(&self, job_id: &str, at: Option<DateTime<Utc>>) {
        self.write().entry(job_id.to_string()).or_default().next_run_at = at;
    }

    pub fn mark_running(
        &self,
        job_id: &str,
        run_id: &str,
        trigger: Trigger,
        since: DateTime<Utc>,
    ) {
        let mut jobs = self.write();
        let state = jobs.entry(job_id.to_string()).or_default();
        state.running_since = Some(since);
        state.current_run_id = Some(run_id.to_string());
        state.current_trigger = Some(trigger);
    }

    /// Clear the running marker and set the next fire time.
    pub fn mark_finished(&self, job_id: &str, next_run_at: Option<DateTime<Utc>>) {
        let mut jobs = self.write();
        let state = jobs.entry(job_id.to_string()).or_default();
        state.running_since = None;
        state.current_run_id = None;
        state.current_trigger = None;
        state.next_run_at = next_run_at;
    }

    /// Ids of jobs currently running.
    pub fn running(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .read()
            .iter()
            .filter(|(_, s)| s.running_since.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, JobState>> {
        self.jobs.read().expect("scheduler state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, JobState>> {
        self.jobs.write().expect("scheduler state lock poisoned")
    }
}
