//! Scheduler service.
//!
//! A single coordination loop keeps a sorted fire queue, wakes at the
//! soonest fire time (or the heartbeat, whichever comes first) and hands
//! each due job to the [`Dispatcher`]. The loop never waits on a run: the
//! dispatcher's lock check is non-blocking and the run itself executes in
//! its own task.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::background::BackgroundTasks;
use crate::history::{Trigger, new_run_id};
use crate::jobs::{JobDescriptor, JobId};
use crate::orchestrator::Orchestrator;
use crate::sync::ExecutionLocks;

use super::error::{Result, SchedulerError};
use super::state::SchedulerState;

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ============================================================================
// Public API
// ============================================================================

/// Result of a dispatch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Dispatched { run_id: String },
    /// A run of the job was already in flight; a `skipped` record was written.
    Skipped,
}

/// Handle for interacting with the scheduler service.
#[derive(Clone)]
pub struct SchedulerHandle {
    dispatcher: Arc<Dispatcher>,
    loop_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_grace: Duration,
}

impl SchedulerHandle {
    /// Run `job_id` now, under the same lock discipline as scheduled fires.
    pub fn trigger_now(&self, job_id: &str) -> Result<TriggerOutcome> {
        if self.dispatcher.cancel.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let job = self
            .dispatcher
            .orchestrator
            .registry()
            .get(job_id)
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?
            .clone();
        Ok(self.dispatcher.dispatch(&job, Trigger::Manual))
    }

    pub fn state(&self) -> Arc<SchedulerState> {
        self.dispatcher.state.clone()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.dispatcher.locks.is_held(job_id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.dispatcher.cancel.is_cancelled()
    }

    /// Stop dispatching, wait for in-flight runs up to the grace period,
    /// then abort what is left. Every execution lock is released on return.
    pub async fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.dispatcher.cancel.cancel();

        let loop_task = self.loop_task.lock().expect("mutex poisoned").take();
        if let Some(handle) = loop_task {
            let _ = handle.await;
        }

        self.dispatcher.tasks.shutdown(self.shutdown_grace).await;
        self.record_aborted().await;
        info!("Scheduler stopped");
    }

    /// Runs aborted after the grace period never wrote their own record.
    async fn record_aborted(&self) {
        let state = &self.dispatcher.state;
        let orchestrator = &self.dispatcher.orchestrator;
        for job_id in state.running() {
            let Some(job_state) = state.job(&job_id) else {
                continue;
            };
            if let (Some(job), Some(run_id), Some(started_at)) = (
                orchestrator.registry().get(&job_id),
                job_state.current_run_id,
                job_state.running_since,
            ) {
                let recorded = orchestrator
                    .history()
                    .latest(&job_id)
                    .is_some_and(|r| r.run_id == run_id);
                if !recorded {
                    warn!(job_id = %job_id, run_id = %run_id, "Run aborted after shutdown grace");
                    let trigger = job_state.current_trigger.unwrap_or(Trigger::Scheduled);
                    orchestrator
                        .record_interrupted(job, run_id, trigger, started_at)
                        .await;
                }
            }
            state.mark_finished(&job_id, job_state.next_run_at);
        }
    }
}

/// The scheduler service.
pub struct SchedulerService {
    orchestrator: Arc<Orchestrator>,
    heartbeat: Duration,
    shutdown_grace: Duration,
    cancel: CancellationToken,
}

impl SchedulerService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            heartbeat: DEFAULT_HEARTBEAT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            cancel: CancellationToken::new(),
        }
    }

    /// Longest the loop sleeps between ticks.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat.max(Duration::from_millis(1));
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Cancelled on shutdown; runs observe it between and during attempts.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start the coordination loop.
    ///
    /// Returns a handle for interacting with the service.
    pub fn start(self) -> SchedulerHandle {
        let registry = self.orchestrator.registry().clone();
        let now = self.orchestrator.now();
        let state = Arc::new(SchedulerState::new(
            registry.list_jobs().iter().map(|j| j.id.as_str()),
            now,
        ));

        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher {
            orchestrator: self.orchestrator,
            locks: ExecutionLocks::new(),
            state,
            tasks: BackgroundTasks::new(),
            cancel: self.cancel,
            finished: finished_tx,
        });

        let mut queue = FireQueue::default();
        for job in registry.enabled() {
            let next = job.cadence.next_after(now);
            dispatcher.state.set_next_run(&job.id, next);
            if let Some(at) = next {
                queue.schedule(&job.id, at);
            }
        }

        let loop_task = tokio::spawn(run_loop(
            dispatcher.clone(),
            queue,
            finished_rx,
            self.heartbeat,
        ));

        SchedulerHandle {
            dispatcher,
            loop_task: Arc::new(Mutex::new(Some(loop_task))),
            shutdown_grace: self.shutdown_grace,
        }
    }
}

// ============================================================================
// Fire queue
// ============================================================================

/// Next fire time per job, ordered by time then job id.
#[derive(Debug, Default)]
struct FireQueue {
    order: BTreeSet<(DateTime<Utc>, JobId)>,
    by_job: HashMap<JobId, DateTime<Utc>>,
}

impl FireQueue {
    fn schedule(&mut self, job_id: &str, at: DateTime<Utc>) {
        self.unschedule(job_id);
        self.order.insert((at, job_id.to_string()));
        self.by_job.insert(job_id.to_string(), at);
    }

    fn unschedule(&mut self, job_id: &str) {
        if let Some(at) = self.by_job.remove(job_id) {
            self.order.remove(&(at, job_id.to_string()));
        }
    }

    fn peek(&self) -> Option<DateTime<Utc>> {
        self.order.first().map(|(at, _)| *at)
    }

    /// Remove and return the earliest job if it is due at `now`.
    fn pop_due(&mut self, now: DateTime<Utc>) -> Option<JobId> {
        let (at, _) = self.order.first()?;
        if *at > now {
            return None;
        }
        let (_, job_id) = self.order.pop_first()?;
        self.by_job.remove(&job_id);
        Some(job_id)
    }
}

// ============================================================================
// Coordination loop
// ============================================================================

async fn run_loop(
    dispatcher: Arc<Dispatcher>,
    mut queue: FireQueue,
    mut finished_rx: mpsc::UnboundedReceiver<JobId>,
    heartbeat: Duration,
) {
    info!(jobs = queue.by_job.len(), "Scheduler started");
    let registry = dispatcher.orchestrator.registry().clone();

    loop {
        let now = dispatcher.orchestrator.now();
        dispatcher.state.tick(now);

        while let Some(job_id) = queue.pop_due(now) {
            let Some(job) = registry.get(&job_id) else {
                continue;
            };
            debug!(job_id = %job.id, "Job due");
            dispatcher.dispatch(job, Trigger::Scheduled);

            // One fire per due job: missed ticks are not replayed.
            let next = job.cadence.next_after(now);
            dispatcher.state.set_next_run(&job.id, next);
            if let Some(at) = next {
                queue.schedule(&job.id, at);
            }
        }

        let sleep_for = queue
            .peek()
            .and_then(|at| (at - now).to_std().ok())
            .map_or(heartbeat, |until| until.min(heartbeat));

        tokio::select! {
            _ = dispatcher.cancel.cancelled() => break,
            Some(job_id) = finished_rx.recv() => {
                if let Some(at) = dispatcher.state.next_run_at(&job_id)
                    && registry.get(&job_id).is_some_and(|j| j.enabled)
                {
                    queue.schedule(&job_id, at);
                }
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    info!("Scheduler loop stopped");
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    locks: ExecutionLocks,
    state: Arc<SchedulerState>,
    tasks: BackgroundTasks,
    cancel: CancellationToken,
    finished: mpsc::UnboundedSender<JobId>,
}

/// Aborts the run task if its supervisor is dropped (shutdown abort).
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Dispatcher {
    fn dispatch(self: &Arc<Self>, job: &JobDescriptor, trigger: Trigger) -> TriggerOutcome {
        let Some(guard) = self.locks.try_acquire(&job.id) else {
            let this = self.clone();
            let job = job.clone();
            self.tasks.spawn(format!("{}:skipped", job.id), async move {
                this.orchestrator.record_skipped(&job, trigger).await;
            });
            return TriggerOutcome::Skipped;
        };

        let run_id = new_run_id();
        let started_at = self.orchestrator.now();
        self.state.mark_running(&job.id, &run_id, trigger, started_at);

        let this = self.clone();
        let job = job.clone();
        let supervised_run_id = run_id.clone();
        self.tasks.spawn(job.id.clone(), async move {
            let run_id = supervised_run_id;
            let run = {
                let this = this.clone();
                let job = job.clone();
                let run_id = run_id.clone();
                tokio::spawn(async move {
                    this.orchestrator
                        .run_job(&job, run_id, trigger, &this.cancel)
                        .await;
                })
            };
            let _abort = AbortOnDrop(run.abort_handle());

            if let Err(e) = run.await
                && e.is_panic()
            {
                let message = panic_message(e.into_panic());
                error!(job_id = %job.id, run_id = %run_id, panic = %message, "Run panicked");
                this.orchestrator
                    .record_panic(&job, run_id, trigger, started_at, message)
                    .await;
            }

            let next = job
                .enabled
                .then(|| job.cadence.next_after(this.orchestrator.now()))
                .flatten();
            this.state.mark_finished(&job.id, next);
            drop(guard);
            let _ = this.finished.send(job.id.clone());
        });

        TriggerOutcome::Dispatched { run_id }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
