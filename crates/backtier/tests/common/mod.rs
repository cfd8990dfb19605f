//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use axum::Router;
use axum::extract::connect_info::MockConnectInfo;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use backtier::alert::{AlertChannel, AlertError, AlertKind, AlertMessage};
use backtier::clock::Clock;
use backtier::config::JobConfig;
use backtier::executor::{ExecutionContext, ExecutorResult, TierExecutor};
use backtier::history::{ArtifactRef, RunHistory, RunRecord};
use backtier::jobs::{CadenceZone, JobRegistry, Tier};
use backtier::orchestrator::RetryPolicy;
use backtier::retention::RetentionPolicy;
use backtier::scheduler::SchedulerHandle;
use backtier::server::{self, AppState};
use backtier::status::StatusReporter;

/// 2026-05-01 03:00:00 UTC, a Friday.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).unwrap()
}

// ============================================================================
// Registry
// ============================================================================

pub fn policies() -> BTreeMap<String, RetentionPolicy> {
    BTreeMap::from([(
        "short".to_string(),
        RetentionPolicy {
            daily: 3,
            weekly: 0,
            monthly: 0,
            floor: 1,
            ..RetentionPolicy::default()
        },
    )])
}

/// Registry from a YAML job list, with fast retries unless a job sets its own.
pub fn registry(jobs_yaml: &str) -> Arc<JobRegistry> {
    let jobs: Vec<JobConfig> = serde_saphyr::from_str(jobs_yaml).unwrap();
    let retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1_000,
        max_delay_ms: 10_000,
        jitter_ratio: 0.0,
    };
    Arc::new(JobRegistry::load(&jobs, &policies(), &retry, CadenceZone::Utc).unwrap())
}

// ============================================================================
// Clocks
// ============================================================================

/// Wall clock that follows tokio time, so paused-time tests see cadences fire.
pub struct TokioClock {
    start: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            start,
            origin: tokio::time::Instant::now(),
        })
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now() - self.origin;
        self.start + chrono::Duration::from_std(elapsed).unwrap()
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Default)]
pub struct RecordingAlerts {
    messages: Mutex<Vec<AlertMessage>>,
}

impl RecordingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<AlertKind> {
        self.messages.lock().unwrap().iter().map(|m| m.kind).collect()
    }

    pub fn messages(&self) -> Vec<AlertMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertChannel for RecordingAlerts {
    async fn send(&self, message: &AlertMessage) -> Result<(), AlertError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Records every message, then reports the webhook as unreachable.
#[derive(Default)]
pub struct FailingAlerts {
    attempts: Mutex<Vec<AlertKind>>,
}

impl FailingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<AlertKind> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertChannel for FailingAlerts {
    async fn send(&self, message: &AlertMessage) -> Result<(), AlertError> {
        self.attempts.lock().unwrap().push(message.kind);
        Err(AlertError::Status {
            status: reqwest::StatusCode::BAD_GATEWAY,
        })
    }
}

/// Never finishes a delivery.
#[derive(Default)]
pub struct HangingAlerts {
    sending: Notify,
}

impl HangingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once a delivery has started.
    pub async fn sending(&self) {
        self.sending.notified().await;
    }
}

#[async_trait]
impl AlertChannel for HangingAlerts {
    async fn send(&self, _message: &AlertMessage) -> Result<(), AlertError> {
        self.sending.notify_one();
        std::future::pending().await
    }
}

// ============================================================================
// Executors
// ============================================================================

pub enum Script {
    Return(ExecutorResult),
    Panic(&'static str),
    /// Never completes.
    Hang,
    /// Completes with success once [`ScriptedExecutor::release`] is called.
    Gate,
}

/// Plays back scripted attempt results. Succeeds once the script runs out.
pub struct ScriptedExecutor {
    tier: Tier,
    script: Mutex<VecDeque<Script>>,
    calls: AtomicU32,
    gate: Notify,
    started: Notify,
}

impl ScriptedExecutor {
    pub fn new(tier: Tier, script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            tier,
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            gate: Notify::new(),
            started: Notify::new(),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Resolves once an attempt has started.
    pub async fn started(&self) {
        self.started.notified().await;
    }
}

pub fn snapshot_artifact(name: &str) -> ArtifactRef {
    ArtifactRef::Snapshot {
        dataset: "tank/data".to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl TierExecutor for ScriptedExecutor {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn run(&self, ctx: &ExecutionContext<'_>) -> ExecutorResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        let step = self.script.lock().unwrap().pop_front();
        let done = || {
            ExecutorResult::success(snapshot_artifact(&format!(
                "{}-{}",
                ctx.job.id, ctx.attempt
            )))
        };
        match step {
            Some(Script::Return(result)) => result,
            Some(Script::Panic(message)) => panic!("{message}"),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Gate) => {
                self.gate.notified().await;
                done()
            }
            None => done(),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Poll `history` until `job_id` has `count` records. Panics after ~10s of
/// (possibly paused) tokio time.
pub async fn wait_for_records(
    history: &RunHistory,
    job_id: &str,
    count: usize,
) -> Vec<Arc<RunRecord>> {
    for _ in 0..1_000 {
        let records = history.recent(job_id, usize::MAX);
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} records of {job_id}");
}

// ============================================================================
// HTTP
// ============================================================================

pub const SNAPSHOT_ONLY: &str = r#"
- id: snapshot-daily
  name: Daily snapshot
  tier: snapshot
  cadence: "0 3 * * *"
  label: daily
- id: snapshot-weekly
  tier: snapshot
  cadence: "0 3 * * 0"
  label: weekly
  enabled: false
"#;

pub fn app_state(
    registry: Arc<JobRegistry>,
    history: RunHistory,
    scheduler: Option<SchedulerHandle>,
) -> AppState {
    let (shutdown_tx, _shutdown_rx) = server::shutdown_channel();
    let mut status = StatusReporter::new(registry, history.clone());
    if let Some(handle) = &scheduler {
        status = status.with_scheduler(handle.state());
    }
    AppState {
        status,
        history,
        scheduler,
        admin_token: None,
        api_token: None,
        heartbeat_seconds: 30,
        started_at: Instant::now(),
        shutdown_tx: Arc::new(AsyncMutex::new(Some(shutdown_tx))),
    }
}

/// Router as seen from `peer`.
pub fn test_app_from(state: AppState, peer: SocketAddr) -> Router {
    server::build_app(state, 30, 16).layer(MockConnectInfo(peer))
}

pub fn test_app(state: AppState) -> Router {
    test_app_from(state, SocketAddr::from(([127, 0, 0, 1], 40000)))
}
