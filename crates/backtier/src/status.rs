//! Read-only status and health views over the registry, run history and
//! scheduler state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::history::{ErrorKind, Outcome, RunHistory};
use crate::jobs::{JobId, JobRegistry, Tier};
use crate::scheduler::SchedulerState;

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub name: String,
    pub tier: Tier,
    pub cadence: String,
    pub enabled: bool,
    /// Start of the latest completed (non-skipped) run.
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorKind>,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub healthy: bool,
    pub scheduler: SchedulerStatus,
    pub jobs: Vec<JobStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub failing_jobs: Vec<JobId>,
    pub scheduler_stale: bool,
}

#[derive(Clone)]
pub struct StatusReporter {
    registry: Arc<JobRegistry>,
    history: RunHistory,
    scheduler: Option<Arc<SchedulerState>>,
    liveness_window: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl StatusReporter {
    pub fn new(registry: Arc<JobRegistry>, history: RunHistory) -> Self {
        Self {
            registry,
            history,
            scheduler: None,
            liveness_window: chrono::Duration::seconds(300),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_scheduler(mut self, state: Arc<SchedulerState>) -> Self {
        self.scheduler = Some(state);
        self
    }

    pub fn with_liveness_window(mut self, window: chrono::Duration) -> Self {
        self.liveness_window = window;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Healthy iff no job's latest completed run failed and the scheduler
    /// loop has ticked within the liveness window.
    pub fn health(&self) -> Health {
        let failing_jobs: Vec<JobId> = self
            .registry
            .list_jobs()
            .iter()
            .filter(|job| {
                self.history
                    .latest_completed(&job.id)
                    .is_some_and(|r| r.outcome == Outcome::Failure)
            })
            .map(|job| job.id.clone())
            .collect();
        let scheduler_stale = self.scheduler_stale();

        Health {
            healthy: failing_jobs.is_empty() && !scheduler_stale,
            failing_jobs,
            scheduler_stale,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let jobs = self
            .registry
            .list_jobs()
            .iter()
            .map(|job| {
                let last = self.history.latest_completed(&job.id);
                let state = self.scheduler.as_ref().and_then(|s| s.job(&job.id));
                JobStatus {
                    id: job.id.clone(),
                    name: job.name.clone(),
                    tier: job.tier,
                    cadence: job.cadence.expr().to_string(),
                    enabled: job.enabled,
                    last_run: last.as_ref().map(|r| r.started_at),
                    next_run: state.as_ref().and_then(|s| s.next_run_at),
                    last_outcome: last.as_ref().map(|r| r.outcome),
                    last_error: last
                        .as_ref()
                        .and_then(|r| r.error.as_ref())
                        .map(|e| e.message.clone()),
                    last_error_kind: last.as_ref().and_then(|r| r.error_kind()),
                    running: state.is_some_and(|s| s.running_since.is_some()),
                }
            })
            .collect();

        let health = self.health();
        StatusSnapshot {
            healthy: health.healthy,
            scheduler: SchedulerStatus {
                started_at: self.scheduler.as_ref().map(|s| s.started_at()),
                last_tick: self.scheduler.as_ref().and_then(|s| s.last_tick()),
                stale: health.scheduler_stale,
            },
            jobs,
        }
    }

    fn scheduler_stale(&self) -> bool {
        let Some(state) = &self.scheduler else {
            return false;
        };
        let reference = state.last_tick().unwrap_or_else(|| state.started_at());
        self.clock.now() - reference > self.liveness_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{default_jobs, default_retention_policies};
    use crate::history::{HistoryLimits, RunError, RunRecord, Trigger, new_run_id};
    use crate::jobs::CadenceZone;
    use crate::orchestrator::RetryPolicy;
    use chrono::TimeZone;

    fn registry() -> Arc<JobRegistry> {
        Arc::new(
            JobRegistry::load(
                &default_jobs(),
                &default_retention_policies(),
                &RetryPolicy::default(),
                CadenceZone::Utc,
            )
            .unwrap(),
        )
    }

    fn record(job_id: &str, at: DateTime<Utc>, outcome: Outcome) -> RunRecord {
        RunRecord {
            run_id: new_run_id(),
            job_id: job_id.to_string(),
            tier: Tier::Snapshot,
            trigger: Trigger::Scheduled,
            started_at: at,
            finished_at: at,
            outcome,
            error: (outcome == Outcome::Failure).then(|| RunError {
                kind: ErrorKind::PermanentExecutionFailure,
                message: "store full".to_string(),
            }),
            artifact: None,
            attempts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn failure_makes_unhealthy_until_next_success() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let history = RunHistory::new(HistoryLimits::default());
        let state = Arc::new(SchedulerState::new(["snapshot-daily"], t0));
        state.tick(t0);
        let reporter = StatusReporter::new(registry(), history.clone())
            .with_scheduler(state)
            .with_clock(clock);

        assert!(reporter.health().healthy);

        history
            .append(record("snapshot-daily", t0, Outcome::Failure))
            .await;
        let health = reporter.health();
        assert!(!health.healthy);
        assert_eq!(health.failing_jobs, vec!["snapshot-daily".to_string()]);

        // A skipped run does not mask the failure.
        history
            .append(record("snapshot-daily", t0, Outcome::Skipped))
            .await;
        assert!(!reporter.health().healthy);

        history
            .append(record("snapshot-daily", t0, Outcome::Success))
            .await;
        assert!(reporter.health().healthy);
    }

    #[test]
    fn stale_scheduler_is_unhealthy() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let state = Arc::new(SchedulerState::new(["snapshot-daily"], t0));
        state.tick(t0);
        let reporter = StatusReporter::new(registry(), RunHistory::new(HistoryLimits::default()))
            .with_scheduler(state)
            .with_liveness_window(chrono::Duration::seconds(300))
            .with_clock(clock.clone());

        clock.advance(chrono::Duration::seconds(299));
        assert!(!reporter.health().scheduler_stale);
        clock.advance(chrono::Duration::seconds(2));
        let health = reporter.health();
        assert!(health.scheduler_stale);
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn snapshot_lists_jobs_with_last_and_next_run() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).unwrap();
        let history = RunHistory::new(HistoryLimits::default());
        let state = Arc::new(SchedulerState::new(["snapshot-daily"], t0));
        let next = t0 + chrono::Duration::days(1);
        state.set_next_run("snapshot-daily", Some(next));
        state.mark_running("replication", "run-1", Trigger::Scheduled, t0);
        history
            .append(record("snapshot-daily", t0, Outcome::Failure))
            .await;

        let reporter = StatusReporter::new(registry(), history)
            .with_scheduler(state)
            .with_clock(Arc::new(ManualClock::new(t0)));
        let snapshot = reporter.snapshot();

        assert_eq!(snapshot.jobs.len(), 5);
        let daily = &snapshot.jobs[0];
        assert_eq!(daily.id, "snapshot-daily");
        assert_eq!(daily.cadence, "0 3 * * *");
        assert_eq!(daily.last_run, Some(t0));
        assert_eq!(daily.next_run, Some(next));
        assert_eq!(daily.last_outcome, Some(Outcome::Failure));
        assert_eq!(daily.last_error.as_deref(), Some("store full"));
        assert!(!daily.running);
        assert!(snapshot.jobs[3].running);
        assert!(!snapshot.healthy);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["jobs"][0]["last_outcome"], "failure");
        assert_eq!(json["jobs"][0]["tier"], 1);
    }
}
