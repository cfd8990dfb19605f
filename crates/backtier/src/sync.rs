//! Synchronization primitives.
//!
//! - [`KeyedLocks`]: one async mutex per string key, created on first use.
//! - [`ExecutionLocks`]: per-job run exclusion with a non-blocking acquire.
//! - [`ArtifactPins`]: reference-counted "in use" marks on artifacts so
//!   retention leaves them alone while a downstream run reads them.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::jobs::{JobId, Tier};

// ============================================================================
// KeyedLocks
// ============================================================================

#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `key`, created if absent.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(key) {
            return lock.clone();
        }
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// ============================================================================
// ExecutionLocks
// ============================================================================

/// At most one run per job id.
#[derive(Clone, Default)]
pub struct ExecutionLocks {
    locks: KeyedLocks,
}

/// Held for the whole run, retries included. Dropping it releases the job.
#[derive(Debug)]
pub struct ExecutionGuard {
    job_id: JobId,
    _guard: OwnedMutexGuard<()>,
}

impl ExecutionGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        debug!(job_id = %self.job_id, "Execution lock released");
    }
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire without waiting; `None` if a run of `job_id` is in flight.
    pub fn try_acquire(&self, job_id: &str) -> Option<ExecutionGuard> {
        let guard = self.locks.get(job_id).try_lock_owned().ok()?;
        Some(ExecutionGuard {
            job_id: job_id.to_string(),
            _guard: guard,
        })
    }

    pub fn is_held(&self, job_id: &str) -> bool {
        self.locks.get(job_id).try_lock().is_err()
    }
}

// ============================================================================
// ArtifactPins
// ============================================================================

#[derive(Clone, Default)]
pub struct ArtifactPins {
    pins: Arc<DashMap<(Tier, String), usize>>,
}

/// Unpins on drop.
#[derive(Debug)]
pub struct PinGuard {
    pins: Arc<DashMap<(Tier, String), usize>>,
    key: (Tier, String),
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.pins.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.pins.remove_if(&self.key, |_, count| *count == 0);
    }
}

impl ArtifactPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, tier: Tier, id: &str) -> PinGuard {
        let key = (tier, id.to_string());
        *self.pins.entry(key.clone()).or_insert(0) += 1;
        PinGuard {
            pins: self.pins.clone(),
            key,
        }
    }

    /// Ids of `tier` currently pinned.
    pub fn pinned(&self, tier: Tier) -> HashSet<String> {
        self.pins
            .iter()
            .filter(|entry| entry.key().0 == tier)
            .map(|entry| entry.key().1.clone())
            .collect()
    }
}

impl std::fmt::Debug for ArtifactPins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactPins")
            .field("pinned", &self.pins.len())
            .finish()
    }
}
