//! Runs one job end-to-end.
//!
//! ```text
//! dependency check ─► attempt ─► (backoff ─► attempt)* ─► retention ─► alert ─► record
//! ```
//!
//! Every path ends in exactly one appended [`RunRecord`]. Retention and
//! alert delivery failures are logged and never change the run's outcome.

mod error;
mod retry;

pub use error::JobError;
pub use retry::{RetryMachine, RetryPolicy, Step};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertChannel, AlertKind, AlertMessage, AlertPolicy, LogAlertChannel};
use crate::clock::{Clock, SystemClock};
use crate::executor::{
    ExecutionContext, ExecutorResult, Executors, RetentionTarget, TierExecutor,
};
use crate::history::{
    ArtifactRef, AttemptRecord, ErrorKind, Outcome, RunError, RunHistory, RunRecord, Trigger,
};
use crate::jobs::{JobDescriptor, JobRegistry};
use crate::retention::{Artifact, RetentionError, RetentionPolicy, prune_targets_protecting};
use crate::sync::{ArtifactPins, KeyedLocks};

/// What retention would do to one job's artifact set.
#[derive(Debug, Clone)]
pub struct RetentionPlan {
    /// Existing artifacts, as listed.
    pub artifacts: Vec<Artifact>,
    pub protected: HashSet<String>,
    pub doomed: BTreeSet<String>,
}

impl RetentionPlan {
    pub fn kept(&self) -> usize {
        self.artifacts.len() - self.doomed.len()
    }
}

pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    executors: Executors,
    history: RunHistory,
    policies: BTreeMap<String, RetentionPolicy>,
    alerts: Arc<dyn AlertChannel>,
    alert_policy: AlertPolicy,
    pins: ArtifactPins,
    retention_locks: KeyedLocks,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(registry: Arc<JobRegistry>, executors: Executors, history: RunHistory) -> Self {
        Self {
            registry,
            executors,
            history,
            policies: BTreeMap::new(),
            alerts: Arc::new(LogAlertChannel),
            alert_policy: AlertPolicy::default(),
            pins: ArtifactPins::new(),
            retention_locks: KeyedLocks::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_policies(mut self, policies: BTreeMap<String, RetentionPolicy>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_alerts(mut self, channel: Arc<dyn AlertChannel>, policy: AlertPolicy) -> Self {
        self.alerts = channel;
        self.alert_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn pins(&self) -> &ArtifactPins {
        &self.pins
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    /// Execute `job` and record the result.
    ///
    /// The caller holds the job's execution lock for the whole call.
    pub async fn run_job(
        &self,
        job: &JobDescriptor,
        run_id: String,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Arc<RunRecord> {
        let started_at = self.clock.now();
        info!(job_id = %job.id, run_id = %run_id, tier = %job.tier, ?trigger, "Run started");

        if let Err(e) = self.check_dependency(job, started_at) {
            warn!(job_id = %job.id, error = %e, "Dependency not satisfied");
            return self
                .finish(job, run_id, trigger, started_at, Vec::new(), Err(e))
                .await;
        }

        let Some(executor) = self.executors.get(job.tier).cloned() else {
            let e = JobError::PermanentExecutionFailure {
                detail: format!("no executor configured for tier {}", job.tier),
            };
            return self
                .finish(job, run_id, trigger, started_at, Vec::new(), Err(e))
                .await;
        };

        let (attempts, result) = self.attempt_with_retry(job, &run_id, &*executor, cancel).await;

        if let Ok(artifact) = &result
            && let Err(e) = self
                .bounded_retention(job, &*executor, artifact.as_ref(), cancel)
                .await
        {
            warn!(job_id = %job.id, error = %e, "Retention failed");
        }

        self.finish(job, run_id, trigger, started_at, attempts, result)
            .await
    }

    /// Record a dispatch that found the previous run still active.
    pub async fn record_skipped(&self, job: &JobDescriptor, trigger: Trigger) -> Arc<RunRecord> {
        let now = self.clock.now();
        warn!(job_id = %job.id, "Previous run still active, skipping");
        self.history
            .append(RunRecord {
                run_id: crate::history::new_run_id(),
                job_id: job.id.clone(),
                tier: job.tier,
                trigger,
                started_at: now,
                finished_at: now,
                outcome: Outcome::Skipped,
                error: Some(RunError {
                    kind: ErrorKind::PreviousRunActive,
                    message: "previous run still active".to_string(),
                }),
                artifact: None,
                attempts: Vec::new(),
            })
            .await
    }

    /// Record a run whose task panicked.
    pub async fn record_panic(
        &self,
        job: &JobDescriptor,
        run_id: String,
        trigger: Trigger,
        started_at: DateTime<Utc>,
        message: String,
    ) -> Arc<RunRecord> {
        self.finish(
            job,
            run_id,
            trigger,
            started_at,
            Vec::new(),
            Err(JobError::Panicked(message)),
        )
        .await
    }

    /// Record a run that was aborted before it could record itself.
    pub async fn record_interrupted(
        &self,
        job: &JobDescriptor,
        run_id: String,
        trigger: Trigger,
        started_at: DateTime<Utc>,
    ) -> Arc<RunRecord> {
        self.finish(
            job,
            run_id,
            trigger,
            started_at,
            Vec::new(),
            Err(JobError::Interrupted),
        )
        .await
    }

    fn check_dependency(&self, job: &JobDescriptor, now: DateTime<Utc>) -> Result<(), JobError> {
        let Some(dep) = job.depends_on else {
            return Ok(());
        };
        let fresh = self
            .history
            .latest_success_in_tier(dep.tier)
            .is_some_and(|r| now - r.finished_at <= dep.freshness);
        if fresh {
            Ok(())
        } else {
            Err(JobError::DependencyUnsatisfied {
                tier: dep.tier,
                freshness_hours: dep.freshness.num_hours(),
            })
        }
    }

    async fn attempt_with_retry(
        &self,
        job: &JobDescriptor,
        run_id: &str,
        executor: &dyn TierExecutor,
        cancel: &CancellationToken,
    ) -> (Vec<AttemptRecord>, Result<Option<ArtifactRef>, JobError>) {
        let last_success = self.history.latest_success(&job.id);
        let mut machine = RetryMachine::new(job.retry.clone());
        let mut attempts = Vec::new();
        let mut attempt = machine.start();

        let result = 'attempts: loop {
            let attempt_started = self.clock.now();
            let ctx = ExecutionContext {
                job,
                run_id,
                attempt,
                now: attempt_started,
                last_success: last_success.clone(),
                pins: self.pins.clone(),
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'attempts Err(JobError::Interrupted),
                r = tokio::time::timeout(job.attempt_timeout, executor.run(&ctx)) => match r {
                    Ok(result) => result,
                    Err(_) => ExecutorResult::transient(format!(
                        "attempt timed out after {}s",
                        job.attempt_timeout.as_secs()
                    )),
                },
            };

            attempts.push(AttemptRecord {
                attempt,
                started_at: attempt_started,
                finished_at: self.clock.now(),
                classification: result.classification,
                detail: result.detail.clone(),
            });

            match machine.record(result.classification) {
                Step::Succeeded => break Ok(result.artifact),
                Step::GiveUp { permanent: true } => {
                    break Err(JobError::PermanentExecutionFailure {
                        detail: result.detail,
                    });
                }
                Step::GiveUp { permanent: false } => {
                    break Err(JobError::TransientExecutionFailure {
                        attempts: machine.attempts(),
                        detail: result.detail,
                    });
                }
                Step::RetryAfter(delay) => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        detail = %result.detail,
                        "Attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'attempts Err(JobError::Interrupted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = machine.resume();
                }
            }
        };

        debug!(
            job_id = %job.id,
            attempts = machine.attempts(),
            backoff_ms = machine.elapsed_backoff().as_millis() as u64,
            "Attempts finished"
        );
        (attempts, result)
    }

    // ------------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------------

    /// What retention would delete for `job` right now.
    ///
    /// Returns `Ok(None)` when the job has no retention policy or its tier
    /// has no dated artifact set.
    pub async fn plan_retention(
        &self,
        job: &JobDescriptor,
    ) -> Result<Option<RetentionPlan>, RetentionError> {
        let Some((target, policy)) = self.retention_for(job) else {
            return Ok(None);
        };
        let current = self
            .history
            .latest_success(&job.id)
            .and_then(|r| r.artifact.clone());
        self.plan(job, &*target, policy, current.as_ref()).await.map(Some)
    }

    fn retention_for(
        &self,
        job: &JobDescriptor,
    ) -> Option<(Arc<dyn RetentionTarget>, &RetentionPolicy)> {
        let policy = self.policies.get(job.retention.as_deref()?)?;
        let target = self.executors.get(job.tier)?.retention_target()?;
        Some((target, policy))
    }

    async fn plan(
        &self,
        job: &JobDescriptor,
        target: &dyn RetentionTarget,
        policy: &RetentionPolicy,
        current: Option<&ArtifactRef>,
    ) -> Result<RetentionPlan, RetentionError> {
        let artifacts = target.artifacts().await.map_err(RetentionError::List)?;
        let protected = self.protected_artifacts(job, target, current);
        let doomed = prune_targets_protecting(&artifacts, policy, &protected);
        Ok(RetentionPlan {
            artifacts,
            protected,
            doomed,
        })
    }

    /// Pinned artifacts plus every snapshot a replication chain still needs.
    fn protected_artifacts(
        &self,
        job: &JobDescriptor,
        target: &dyn RetentionTarget,
        current: Option<&ArtifactRef>,
    ) -> HashSet<String> {
        let mut protected = self.pins.pinned(target.tier());

        let downstream = self
            .registry
            .downstream_of(target.tier())
            .filter_map(|j| self.history.latest_success(&j.id))
            .filter_map(|r| r.artifact.clone());
        for artifact in current.cloned().into_iter().chain(downstream) {
            if let ArtifactRef::Replicated { snapshot, base, .. } = artifact {
                protected.insert(snapshot);
                protected.extend(base);
            }
        }

        debug!(job_id = %job.id, protected = protected.len(), "Retention protection computed");
        protected
    }

    /// Retention under the job's attempt timeout, abandoned on shutdown.
    async fn bounded_retention(
        &self,
        job: &JobDescriptor,
        executor: &dyn TierExecutor,
        current: Option<&ArtifactRef>,
        cancel: &CancellationToken,
    ) -> Result<(), RetentionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetentionError::Interrupted),
            r = tokio::time::timeout(
                job.attempt_timeout,
                self.apply_retention(job, executor, current),
            ) => r.unwrap_or(Err(RetentionError::TimedOut(job.attempt_timeout))),
        }
    }

    async fn apply_retention(
        &self,
        job: &JobDescriptor,
        executor: &dyn TierExecutor,
        current: Option<&ArtifactRef>,
    ) -> Result<(), RetentionError> {
        let Some(policy) = job.retention.as_deref().and_then(|p| self.policies.get(p)) else {
            return Ok(());
        };
        let Some(target) = executor.retention_target() else {
            return Ok(());
        };

        // Jobs sharing a tier share its artifact set.
        let lock = self.retention_locks.get(job.tier.name());
        let _guard = lock.lock().await;

        let plan = self.plan(job, &*target, policy, current).await?;
        if plan.doomed.is_empty() {
            debug!(job_id = %job.id, artifacts = plan.artifacts.len(), "Nothing to prune");
            return Ok(());
        }

        let mut failed = 0;
        let mut first_failure = None;
        for artifact in plan.artifacts.iter().filter(|a| plan.doomed.contains(&a.id)) {
            match target.delete(artifact).await {
                Ok(()) => debug!(job_id = %job.id, artifact = %artifact.id, "Pruned"),
                Err(e) => {
                    warn!(job_id = %job.id, artifact = %artifact.id, error = %e, "Failed to prune artifact");
                    failed += 1;
                    first_failure.get_or_insert((artifact.id.clone(), e));
                }
            }
        }

        info!(
            job_id = %job.id,
            deleted = plan.doomed.len() - failed,
            kept = plan.kept(),
            "Retention applied"
        );

        match first_failure {
            None => Ok(()),
            Some((first_id, first_error)) => Err(RetentionError::Delete {
                planned: plan.doomed.len(),
                failed,
                first_id,
                first_error,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    async fn finish(
        &self,
        job: &JobDescriptor,
        run_id: String,
        trigger: Trigger,
        started_at: DateTime<Utc>,
        attempts: Vec<AttemptRecord>,
        result: Result<Option<ArtifactRef>, JobError>,
    ) -> Arc<RunRecord> {
        let finished_at = self.clock.now();
        let previous = self.history.latest_completed(&job.id);
        let attempt_count = attempts.len() as u32;

        let (outcome, error, artifact) = match result {
            Ok(artifact) => (Outcome::Success, None, artifact),
            Err(JobError::Interrupted) => (
                Outcome::Skipped,
                Some(run_error(&JobError::Interrupted)),
                None,
            ),
            Err(e) => (Outcome::Failure, Some(run_error(&e)), None),
        };

        let record = RunRecord {
            run_id,
            job_id: job.id.clone(),
            tier: job.tier,
            trigger,
            started_at,
            finished_at,
            outcome,
            error,
            artifact,
            attempts,
        };

        match record.outcome {
            Outcome::Success => {
                info!(job_id = %job.id, attempts = attempt_count, "Run succeeded");
                let recovered = previous.is_some_and(|p| p.outcome == Outcome::Failure);
                if recovered && self.alert_policy.allows(AlertKind::Recovery) {
                    self.alert(AlertKind::Recovery, job, &record).await;
                } else if self.alert_policy.allows(AlertKind::Success) {
                    self.alert(AlertKind::Success, job, &record).await;
                }
            }
            Outcome::Failure => {
                if let Some(e) = &record.error {
                    error!(job_id = %job.id, kind = e.kind.as_str(), attempts = attempt_count, error = %e.message, "Run failed");
                }
                if self.alert_policy.allows(AlertKind::Failure) {
                    self.alert(AlertKind::Failure, job, &record).await;
                }
            }
            Outcome::Skipped => {
                info!(job_id = %job.id, "Run interrupted by shutdown");
            }
        }

        self.history.append(record).await
    }

    async fn alert(&self, kind: AlertKind, job: &JobDescriptor, record: &RunRecord) {
        let detail = match (&record.error, &record.artifact) {
            (Some(e), _) => e.message.clone(),
            (None, Some(artifact)) => artifact.summary(),
            (None, None) => String::new(),
        };
        let message = AlertMessage {
            kind,
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            tier: job.tier,
            error_kind: record.error_kind(),
            attempts: record.attempts.len() as u32,
            timestamp: record.finished_at,
            detail,
        };
        if let Err(e) = self.alerts.send(&message).await {
            warn!(job_id = %job.id, ?kind, error = %e, "Failed to deliver alert");
        }
    }
}

fn run_error(e: &JobError) -> RunError {
    RunError {
        kind: e.kind(),
        message: e.to_string(),
    }
}
