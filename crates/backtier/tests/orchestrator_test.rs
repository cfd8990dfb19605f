//! End-to-end runs through the orchestrator with in-memory executors and
//! stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use backtier::alert::{AlertKind, AlertPolicy};
use backtier::clock::{Clock, ManualClock};
use backtier::executor::{
    Classification, CloudExecutor, ExecutionContext, ExecutorResult, Executors, RetentionTarget,
    SnapshotExecutor, TierExecutor, snapshot_name,
};
use backtier::history::{
    ArtifactRef, ErrorKind, HistoryLimits, Outcome, RunHistory, RunRecord, Trigger, new_run_id,
};
use backtier::jobs::{JobRegistry, Tier};
use backtier::orchestrator::Orchestrator;
use backtier::retention::Artifact;
use backtier::transport::memory::{MemoryCloud, MemoryOp, MemorySnapshotStore};
use backtier::transport::{TransportError, TransportErrorKind};

use common::{FailingAlerts, RecordingAlerts, Script, ScriptedExecutor, snapshot_artifact, t0};

const CHAIN: &str = r#"
- id: snapshot-daily
  tier: snapshot
  cadence: "0 3 * * *"
  label: daily
  retention: short
- id: replication
  tier: replication
  cadence: "0 4 * * *"
  depends_on:
    tier: snapshot
    freshness_hours: 26
- id: cloud-sync
  tier: cloud
  cadence: "0 5 * * 0"
- id: quick-snapshot
  tier: snapshot
  cadence: "@hourly"
  timeout_seconds: 5
  retry:
    max_attempts: 1
"#;

struct Harness {
    registry: Arc<JobRegistry>,
    history: RunHistory,
    alerts: Arc<RecordingAlerts>,
    clock: Arc<ManualClock>,
    orchestrator: Arc<Orchestrator>,
}

fn harness(executors: Vec<Arc<dyn TierExecutor>>) -> Harness {
    harness_at(executors, Arc::new(ManualClock::new(t0())))
}

fn harness_at(executors: Vec<Arc<dyn TierExecutor>>, clock: Arc<ManualClock>) -> Harness {
    let registry = common::registry(CHAIN);
    let history = RunHistory::new(HistoryLimits::default());
    let alerts = RecordingAlerts::new();
    let executors = executors
        .into_iter()
        .fold(Executors::new(), |acc, e| acc.with(e));
    let orchestrator = Orchestrator::new(registry.clone(), executors, history.clone())
        .with_policies(common::policies())
        .with_alerts(alerts.clone(), AlertPolicy::default())
        .with_clock(clock.clone());

    Harness {
        registry,
        history,
        alerts,
        clock,
        orchestrator: Arc::new(orchestrator),
    }
}

impl Harness {
    async fn run(&self, job_id: &str) -> Arc<RunRecord> {
        let job = self.registry.get(job_id).unwrap();
        self.orchestrator
            .run_job(job, new_run_id(), Trigger::Scheduled, &CancellationToken::new())
            .await
    }
}

fn success_record(
    job_id: &str,
    tier: Tier,
    at: DateTime<Utc>,
    artifact: ArtifactRef,
) -> RunRecord {
    RunRecord {
        run_id: new_run_id(),
        job_id: job_id.to_string(),
        tier,
        trigger: Trigger::Scheduled,
        started_at: at,
        finished_at: at,
        outcome: Outcome::Success,
        error: None,
        artifact: Some(artifact),
        attempts: Vec::new(),
    }
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn transient_failure_then_success_is_one_successful_run() {
    let exec = ScriptedExecutor::new(
        Tier::Snapshot,
        vec![Script::Return(ExecutorResult::transient("dataset busy"))],
    );
    let h = harness(vec![exec.clone()]);

    let started = tokio::time::Instant::now();
    let record = h.run("snapshot-daily").await;

    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.attempts.len(), 2);
    assert_eq!(
        record.attempts[0].classification,
        Classification::TransientFailure
    );
    assert_eq!(record.attempts[1].classification, Classification::Success);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(h.alerts.kinds().is_empty());
    assert_eq!(h.history.recent("snapshot-daily", 10).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_transient_failures_alert_once() {
    let exec = ScriptedExecutor::new(
        Tier::Snapshot,
        vec![
            Script::Return(ExecutorResult::transient("timeout")),
            Script::Return(ExecutorResult::transient("timeout")),
            Script::Return(ExecutorResult::transient("timeout")),
        ],
    );
    let h = harness(vec![exec.clone()]);

    let started = tokio::time::Instant::now();
    let record = h.run("snapshot-daily").await;

    assert_eq!(record.outcome, Outcome::Failure);
    assert_eq!(
        record.error_kind(),
        Some(ErrorKind::TransientExecutionFailure)
    );
    assert_eq!(record.attempts.len(), 3);
    assert_eq!(exec.calls(), 3);
    // 1s then 2s of backoff.
    assert!(started.elapsed() >= Duration::from_secs(3));

    let messages = h.alerts.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, AlertKind::Failure);
    assert_eq!(messages[0].attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let exec = ScriptedExecutor::new(
        Tier::Snapshot,
        vec![Script::Return(ExecutorResult::permanent("out of space"))],
    );
    let h = harness(vec![exec.clone()]);

    let record = h.run("snapshot-daily").await;

    assert_eq!(record.outcome, Outcome::Failure);
    assert_eq!(
        record.error_kind(),
        Some(ErrorKind::PermanentExecutionFailure)
    );
    assert_eq!(exec.calls(), 1);
    assert_eq!(h.alerts.kinds(), vec![AlertKind::Failure]);
    assert_eq!(
        h.alerts.messages()[0].error_kind,
        Some(ErrorKind::PermanentExecutionFailure)
    );
}

#[tokio::test(start_paused = true)]
async fn hung_attempt_times_out_as_transient() {
    let exec = ScriptedExecutor::new(Tier::Snapshot, vec![Script::Hang]);
    let h = harness(vec![exec.clone()]);

    let record = h.run("quick-snapshot").await;

    assert_eq!(record.outcome, Outcome::Failure);
    assert_eq!(
        record.error_kind(),
        Some(ErrorKind::TransientExecutionFailure)
    );
    assert_eq!(record.attempts.len(), 1);
    assert!(record.attempts[0].detail.contains("timed out after 5s"));
}

#[tokio::test]
async fn missing_executor_is_a_permanent_failure() {
    let h = harness(Vec::new());

    let record = h.run("cloud-sync").await;

    assert_eq!(record.outcome, Outcome::Failure);
    assert_eq!(
        record.error_kind(),
        Some(ErrorKind::PermanentExecutionFailure)
    );
    assert!(record.attempts.is_empty());
}

// ============================================================================
// Dependencies and alerts
// ============================================================================

#[tokio::test]
async fn dependency_gate_follows_upstream_freshness() {
    let exec = ScriptedExecutor::new(Tier::Replication, Vec::new());
    let h = harness(vec![exec.clone()]);

    // No upstream success yet.
    let record = h.run("replication").await;
    assert_eq!(record.outcome, Outcome::Failure);
    assert_eq!(record.error_kind(), Some(ErrorKind::DependencyUnsatisfied));
    assert_eq!(exec.calls(), 0);
    assert_eq!(h.alerts.kinds(), vec![AlertKind::Failure]);

    // Fresh upstream success: the run proceeds and the failure recovers.
    h.history
        .append(success_record(
            "snapshot-daily",
            Tier::Snapshot,
            h.clock.now() - chrono::Duration::hours(1),
            common::snapshot_artifact("daily-20260501-020000"),
        ))
        .await;
    let record = h.run("replication").await;
    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(exec.calls(), 1);
    assert_eq!(
        h.alerts.kinds(),
        vec![AlertKind::Failure, AlertKind::Recovery]
    );

    // Upstream success older than the freshness window.
    h.clock.advance(chrono::Duration::hours(30));
    let record = h.run("replication").await;
    assert_eq!(record.error_kind(), Some(ErrorKind::DependencyUnsatisfied));
    assert_eq!(exec.calls(), 1);
}

#[tokio::test]
async fn recovery_alert_only_after_a_failure() {
    let exec = ScriptedExecutor::new(
        Tier::Snapshot,
        vec![Script::Return(ExecutorResult::permanent("pool faulted"))],
    );
    let h = harness(vec![exec]);

    h.run("snapshot-daily").await;
    h.run("snapshot-daily").await;
    h.run("snapshot-daily").await;

    assert_eq!(
        h.alerts.kinds(),
        vec![AlertKind::Failure, AlertKind::Recovery]
    );
}

#[tokio::test]
async fn undeliverable_alerts_do_not_change_outcomes() {
    let exec = ScriptedExecutor::new(
        Tier::Snapshot,
        vec![Script::Return(ExecutorResult::permanent("pool faulted"))],
    );
    let alerts = FailingAlerts::new();
    let history = RunHistory::new(HistoryLimits::default());
    let executor: Arc<dyn TierExecutor> = exec.clone();
    let registry = common::registry(CHAIN);
    let executors = Executors::new().with(executor);
    let orchestrator = Orchestrator::new(registry.clone(), executors, history.clone())
        .with_policies(common::policies())
        .with_alerts(
            alerts.clone(),
            AlertPolicy {
                on_success: true,
                ..AlertPolicy::default()
            },
        )
        .with_clock(Arc::new(ManualClock::new(t0())));
    let job = registry.get("snapshot-daily").unwrap();
    let cancel = CancellationToken::new();

    let failed = orchestrator
        .run_job(job, new_run_id(), Trigger::Scheduled, &cancel)
        .await;
    assert_eq!(failed.outcome, Outcome::Failure);
    assert_eq!(failed.error_kind(), Some(ErrorKind::PermanentExecutionFailure));
    assert_eq!(history.recent("snapshot-daily", 10).len(), 1);

    let recovered = orchestrator
        .run_job(job, new_run_id(), Trigger::Scheduled, &cancel)
        .await;
    assert_eq!(recovered.outcome, Outcome::Success);

    let succeeded = orchestrator
        .run_job(job, new_run_id(), Trigger::Scheduled, &cancel)
        .await;
    assert_eq!(succeeded.outcome, Outcome::Success);

    assert_eq!(exec.calls(), 3);
    assert_eq!(
        alerts.kinds(),
        vec![AlertKind::Failure, AlertKind::Recovery, AlertKind::Success]
    );
    let records = history.recent("snapshot-daily", 10);
    assert_eq!(records.len(), 3);
    assert_eq!(
        records.iter().filter(|r| r.outcome == Outcome::Failure).count(),
        1
    );
}

// ============================================================================
// Cloud tier
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cloud_rate_limit_is_retried() {
    let cloud = MemoryCloud::new();
    cloud.put_local("archive/2026-04.tar", 4096);
    cloud.fail_next(TransportError::new(
        TransportErrorKind::RateLimited,
        "HTTP 429 Too Many Requests",
    ));
    let exec = Arc::new(CloudExecutor::new(
        Arc::new(cloud.clone()),
        "/srv/data",
        "offsite",
    ));
    let h = harness(vec![exec]);

    let record = h.run("cloud-sync").await;

    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.attempts.len(), 2);
    assert_eq!(cloud.sync_calls(), 2);
    match record.artifact.as_ref().unwrap() {
        ArtifactRef::Synced {
            objects_transferred,
            bytes_transferred,
            ..
        } => {
            assert_eq!(*objects_transferred, 1);
            assert_eq!(*bytes_transferred, 4096);
        }
        other => panic!("unexpected artifact {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cloud_quota_is_permanent() {
    let cloud = MemoryCloud::new();
    cloud.fail_next(TransportError::new(
        TransportErrorKind::Quota,
        "storage_cap_exceeded",
    ));
    let exec = Arc::new(CloudExecutor::new(
        Arc::new(cloud.clone()),
        "/srv/data",
        "offsite",
    ));
    let h = harness(vec![exec]);

    let record = h.run("cloud-sync").await;

    assert_eq!(record.outcome, Outcome::Failure);
    assert_eq!(
        record.error_kind(),
        Some(ErrorKind::PermanentExecutionFailure)
    );
    assert_eq!(cloud.sync_calls(), 1);
}

// ============================================================================
// Retention
// ============================================================================

fn seeded_store(clock: &Arc<ManualClock>) -> (MemorySnapshotStore, Vec<String>) {
    let store = MemorySnapshotStore::new("local").with_clock(clock.clone());
    let names = (1..=6)
        .map(|days| {
            let at = t0() - chrono::Duration::days(days);
            let name = snapshot_name("daily", at);
            store.insert("tank/data", &name, at);
            name
        })
        .collect();
    store.insert(
        "tank/data",
        "before-upgrade",
        t0() - chrono::Duration::days(30),
    );
    (store, names)
}

#[tokio::test]
async fn retention_prunes_but_keeps_replication_chain() {
    let clock = Arc::new(ManualClock::new(t0()));
    let (store, old) = seeded_store(&clock);
    let exec = Arc::new(SnapshotExecutor::new(Arc::new(store.clone()), "tank/data"));
    let h = harness_at(vec![exec], clock);

    // The replication chain still needs the two oldest snapshots.
    h.history
        .append(success_record(
            "replication",
            Tier::Replication,
            t0() - chrono::Duration::days(1),
            ArtifactRef::Replicated {
                snapshot: old[5].clone(),
                base: Some(old[4].clone()),
                bytes_transferred: 64,
            },
        ))
        .await;

    let record = h.run("snapshot-daily").await;
    assert_eq!(record.outcome, Outcome::Success);

    let names = store.names("tank/data");
    let newest = snapshot_name("daily", t0());
    assert!(names.contains(&newest));
    // Three most recent days survive.
    assert!(names.contains(&old[0]));
    assert!(names.contains(&old[1]));
    // Protected by the replication chain.
    assert!(names.contains(&old[4]));
    assert!(names.contains(&old[5]));
    // Unmanaged snapshots are never touched.
    assert!(names.contains(&"before-upgrade".to_string()));
    // Pruned.
    assert!(!names.contains(&old[2]));
    assert!(!names.contains(&old[3]));
}

#[tokio::test]
async fn retention_failure_does_not_fail_the_run() {
    let clock = Arc::new(ManualClock::new(t0()));
    let (store, old) = seeded_store(&clock);
    store.fail_next(
        MemoryOp::Destroy,
        TransportError::new(TransportErrorKind::Other, "dataset is busy"),
    );
    let exec = Arc::new(SnapshotExecutor::new(Arc::new(store.clone()), "tank/data"));
    let h = harness_at(vec![exec], clock);

    let record = h.run("snapshot-daily").await;

    assert_eq!(record.outcome, Outcome::Success);
    assert!(h.alerts.kinds().is_empty());
    // First deletion failed, the rest went ahead.
    let remaining = old
        .iter()
        .filter(|n| store.names("tank/data").contains(n))
        .count();
    assert_eq!(remaining, 3);
}

/// Snapshot executor whose artifact listing never returns.
struct StuckListing {
    listing: Arc<Notify>,
}

struct StuckTarget {
    listing: Arc<Notify>,
}

#[async_trait]
impl TierExecutor for StuckListing {
    fn tier(&self) -> Tier {
        Tier::Snapshot
    }

    async fn run(&self, ctx: &ExecutionContext<'_>) -> ExecutorResult {
        ExecutorResult::success(snapshot_artifact(&format!("{}-{}", ctx.job.id, ctx.attempt)))
    }

    fn retention_target(&self) -> Option<Arc<dyn RetentionTarget>> {
        Some(Arc::new(StuckTarget {
            listing: self.listing.clone(),
        }))
    }
}

#[async_trait]
impl RetentionTarget for StuckTarget {
    fn tier(&self) -> Tier {
        Tier::Snapshot
    }

    async fn artifacts(&self) -> Result<Vec<Artifact>, TransportError> {
        self.listing.notify_one();
        std::future::pending().await
    }

    async fn delete(&self, _artifact: &Artifact) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_retention_gives_up_after_attempt_timeout() {
    let exec = Arc::new(StuckListing {
        listing: Arc::new(Notify::new()),
    });
    let h = harness(vec![exec]);

    let started = tokio::time::Instant::now();
    let record = h.run("snapshot-daily").await;

    assert_eq!(record.outcome, Outcome::Success);
    assert!(started.elapsed() >= Duration::from_secs(300));
    assert!(started.elapsed() < Duration::from_secs(600));
    assert_eq!(h.history.recent("snapshot-daily", 10).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_retention_still_records_the_run() {
    let listing = Arc::new(Notify::new());
    let exec = Arc::new(StuckListing {
        listing: listing.clone(),
    });
    let h = harness(vec![exec]);
    let cancel = CancellationToken::new();

    let run = {
        let orchestrator = h.orchestrator.clone();
        let job = h.registry.get("snapshot-daily").unwrap().clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .run_job(&job, new_run_id(), Trigger::Scheduled, &cancel)
                .await
        })
    };

    listing.notified().await;
    let cancelled_at = tokio::time::Instant::now();
    cancel.cancel();
    let record = run.await.unwrap();

    assert_eq!(record.outcome, Outcome::Success);
    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    assert_eq!(h.history.recent("snapshot-daily", 10).len(), 1);
}

#[tokio::test]
async fn dry_run_plan_matches_applied_retention() {
    let clock = Arc::new(ManualClock::new(t0()));
    let (store, old) = seeded_store(&clock);
    let exec = Arc::new(SnapshotExecutor::new(Arc::new(store.clone()), "tank/data"));
    let h = harness_at(vec![exec], clock);

    let job = h.registry.get("snapshot-daily").unwrap();
    let plan = h.orchestrator.plan_retention(job).await.unwrap().unwrap();

    assert_eq!(plan.artifacts.len(), 6);
    assert_eq!(plan.kept(), 3);
    assert!(plan.doomed.contains(&old[3]));
    assert!(plan.doomed.contains(&old[5]));
    assert_eq!(store.calls(MemoryOp::Destroy), 0);

    let cloud = h.registry.get("cloud-sync").unwrap();
    assert!(h.orchestrator.plan_retention(cloud).await.unwrap().is_none());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_records_interrupted() {
    let exec = ScriptedExecutor::new(
        Tier::Snapshot,
        vec![Script::Return(ExecutorResult::transient("busy"))],
    );
    let h = harness(vec![exec.clone()]);
    let cancel = CancellationToken::new();

    let run = {
        let orchestrator = h.orchestrator.clone();
        let job = h.registry.get("snapshot-daily").unwrap().clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .run_job(&job, new_run_id(), Trigger::Manual, &cancel)
                .await
        })
    };

    exec.started().await;
    cancel.cancel();
    let record = run.await.unwrap();

    assert_eq!(record.outcome, Outcome::Skipped);
    assert_eq!(record.error_kind(), Some(ErrorKind::Interrupted));
    assert_eq!(record.trigger, Trigger::Manual);
    assert_eq!(exec.calls(), 1);
    assert!(h.alerts.kinds().is_empty());
}
