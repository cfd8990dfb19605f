//! Registry of in-flight run tasks.
//!
//! Dispatched runs are registered here so shutdown can wait for them, up to
//! a grace period, before aborting whatever is left.

// std::sync::Mutex: never held across an await.
// See: https://docs.rs/tokio/latest/tokio/sync/struct.Mutex.html
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

// ============================================================================
// BackgroundTasks
// ============================================================================

struct Task {
    name: String,
    handle: JoinHandle<()>,
}

/// Registry for tasks that should be awaited on shutdown.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tasks: Arc<Mutex<Vec<Task>>>,
}

impl BackgroundTasks {
    /// Create a new empty task registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task and register its handle under `name`.
    ///
    /// Registration is synchronous, so the handle is tracked before this
    /// method returns even if the task completes immediately.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);

        let mut guard = self.tasks.lock().expect("mutex poisoned");
        guard.retain(|t| !t.handle.is_finished());
        guard.push(Task {
            name: name.into(),
            handle,
        });
    }

    /// Wait for registered tasks, aborting any still running after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let tasks: Vec<Task> = std::mem::take(&mut *self.tasks.lock().expect("mutex poisoned"));
        let pending: Vec<Task> = tasks.into_iter().filter(|t| !t.handle.is_finished()).collect();
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), grace_secs = grace.as_secs(), "Waiting for in-flight runs");
        let deadline = tokio::time::Instant::now() + grace;

        for mut task in pending {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    warn!(task = %task.name, "Task panicked during shutdown");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = %task.name, "Task did not finish within grace period, aborting");
                    task.handle.abort();
                    let _ = task.handle.await;
                }
            }
        }

        info!("In-flight runs finished");
    }

    /// Names of tasks still running.
    pub fn active(&self) -> Vec<String> {
        let mut guard = self.tasks.lock().expect("mutex poisoned");
        guard.retain(|t| !t.handle.is_finished());
        guard.iter().map(|t| t.name.clone()).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn spawn_and_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks = BackgroundTasks::new();

        let c1 = counter.clone();
        tasks.spawn("a", async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c1.fetch_add(1, Ordering::SeqCst);
        });

        let c2 = counter.clone();
        tasks.spawn("b", async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c2.fetch_add(1, Ordering::SeqCst);
        });

        tasks.shutdown(Duration::from_secs(5)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_after_grace() {
        let finished = Arc::new(AtomicUsize::new(0));
        let tasks = BackgroundTasks::new();

        let f = finished.clone();
        tasks.spawn("cloud-sync", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(tasks.active(), vec!["cloud-sync".to_string()]);

        tasks.shutdown(Duration::from_secs(1)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(tasks.active().is_empty());
    }

    #[tokio::test]
    async fn shutdown_empty_is_noop() {
        let tasks = BackgroundTasks::new();
        tasks.shutdown(Duration::from_secs(1)).await;
    }
}
