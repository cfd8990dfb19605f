//! In-memory stores for tests and local experiments.
//!
//! [`MemorySnapshotStore`] keeps snapshots per dataset and serializes them
//! into a small textual stream so a send on one store can be received by
//! another. [`MemoryCloud`] mirrors a set of local objects into buckets.
//! Both can be told to fail the next N calls of an operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CloudTransport, ObjectMeta, SnapshotRef, SnapshotStore, SnapshotStream, SyncStats,
    TransportError, TransportErrorKind,
};
use crate::clock::{Clock, SystemClock};

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Create,
    List,
    Destroy,
    Send,
    Receive,
    Sync,
}

#[derive(Default)]
struct Faults {
    queued: HashMap<MemoryOp, VecDeque<TransportError>>,
    calls: HashMap<MemoryOp, usize>,
}

impl Faults {
    fn enter(&mut self, op: MemoryOp) -> Result<(), TransportError> {
        *self.calls.entry(op).or_default() += 1;
        match self.queued.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ============================================================================
// MemorySnapshotStore
// ============================================================================

#[derive(Default)]
struct SnapshotState {
    datasets: BTreeMap<String, Vec<SnapshotRef>>,
    faults: Faults,
}

#[derive(Clone)]
pub struct MemorySnapshotStore {
    endpoint: String,
    state: Arc<Mutex<SnapshotState>>,
    clock: Arc<dyn Clock>,
}

impl MemorySnapshotStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Arc::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed an existing snapshot.
    pub fn insert(&self, dataset: &str, name: &str, created_at: DateTime<Utc>) -> SnapshotRef {
        let snapshot = SnapshotRef::new(dataset, name, created_at);
        let mut state = self.state.lock().expect("mutex poisoned");
        let snaps = state.datasets.entry(dataset.to_string()).or_default();
        snaps.push(snapshot.clone());
        snaps.sort();
        snapshot
    }

    /// Make the next call of `op` fail with `error`. Calls queue up.
    pub fn fail_next(&self, op: MemoryOp, error: TransportError) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.faults.queued.entry(op).or_default().push_back(error);
    }

    pub fn calls(&self, op: MemoryOp) -> usize {
        let state = self.state.lock().expect("mutex poisoned");
        state.faults.calls.get(&op).copied().unwrap_or(0)
    }

    /// Snapshot names in `dataset`, oldest first.
    pub fn names(&self, dataset: &str) -> Vec<String> {
        let state = self.state.lock().expect("mutex poisoned");
        state
            .datasets
            .get(dataset)
            .map(|snaps| snaps.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    fn enter(&self, op: MemoryOp) -> Result<(), TransportError> {
        self.state.lock().expect("mutex poisoned").faults.enter(op)
    }
}

fn encode(snapshot: &SnapshotRef, base: Option<&SnapshotRef>) -> Vec<u8> {
    let mut out = format!(
        "name={}\ncreated={}\n",
        snapshot.name,
        snapshot.created_at.timestamp()
    );
    if let Some(base) = base {
        out.push_str(&format!("base={}\n", base.name));
    }
    // Pretend payload: full sends carry more data than incremental ones.
    let payload = if base.is_some() { 64 } else { 1024 };
    out.push_str(&"x".repeat(payload));
    out.into_bytes()
}

fn decode(bytes: &[u8]) -> Option<(String, DateTime<Utc>, Option<String>)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut name = None;
    let mut created = None;
    let mut base = None;
    for line in text.lines() {
        if let Some(v) = line.strip_prefix("name=") {
            name = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("created=") {
            created = v.parse::<i64>().ok().and_then(|s| DateTime::from_timestamp(s, 0));
        } else if let Some(v) = line.strip_prefix("base=") {
            base = Some(v.to_string());
        }
    }
    Some((name?, created?, base))
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create(&self, dataset: &str, name: &str) -> Result<SnapshotRef, TransportError> {
        self.enter(MemoryOp::Create)?;
        if self.names(dataset).iter().any(|n| n == name) {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                format!("snapshot {dataset}@{name} already exists"),
            ));
        }
        Ok(self.insert(dataset, name, self.clock.now()))
    }

    async fn list(&self, dataset: &str) -> Result<Vec<SnapshotRef>, TransportError> {
        self.enter(MemoryOp::List)?;
        let state = self.state.lock().expect("mutex poisoned");
        Ok(state.datasets.get(dataset).cloned().unwrap_or_default())
    }

    async fn destroy(&self, snapshot: &SnapshotRef) -> Result<(), TransportError> {
        self.enter(MemoryOp::Destroy)?;
        let mut state = self.state.lock().expect("mutex poisoned");
        let snaps = state.datasets.entry(snapshot.dataset.clone()).or_default();
        let before = snaps.len();
        snaps.retain(|s| s.name != snapshot.name);
        if snaps.len() == before {
            return Err(TransportError::new(
                TransportErrorKind::NotFound,
                format!("snapshot {} does not exist", snapshot.full_name()),
            ));
        }
        Ok(())
    }

    async fn send(
        &self,
        snapshot: &SnapshotRef,
        base: Option<&SnapshotRef>,
    ) -> Result<SnapshotStream, TransportError> {
        self.enter(MemoryOp::Send)?;
        let names = self.names(&snapshot.dataset);
        if !names.contains(&snapshot.name) {
            return Err(TransportError::new(
                TransportErrorKind::NotFound,
                format!("snapshot {} does not exist", snapshot.full_name()),
            ));
        }
        Ok(SnapshotStream::from_bytes(encode(snapshot, base)))
    }

    async fn receive(&self, stream: SnapshotStream, dataset: &str) -> Result<u64, TransportError> {
        self.enter(MemoryOp::Receive)?;
        let bytes = stream.read_to_end().await?;
        let (name, created_at, base) = decode(&bytes).ok_or_else(|| {
            TransportError::new(TransportErrorKind::Other, "malformed snapshot stream")
        })?;

        let existing = self.names(dataset);
        if let Some(base) = base
            && !existing.contains(&base)
        {
            return Err(TransportError::new(
                TransportErrorKind::InvalidDestination,
                format!("incremental base {base} is missing from {dataset}"),
            ));
        }
        if !existing.contains(&name) {
            self.insert(dataset, &name, created_at);
        }
        Ok(bytes.len() as u64)
    }
}

// ============================================================================
// MemoryCloud
// ============================================================================

#[derive(Default)]
struct CloudState {
    local: BTreeMap<String, u64>,
    buckets: BTreeMap<String, BTreeMap<String, u64>>,
    faults: Faults,
}

/// Mirrors a fixed set of "local" objects into named buckets.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<CloudState>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) a local object that the next sync will upload.
    pub fn put_local(&self, key: &str, size: u64) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.local.insert(key.to_string(), size);
    }

    pub fn fail_next(&self, error: TransportError) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state
            .faults
            .queued
            .entry(MemoryOp::Sync)
            .or_default()
            .push_back(error);
    }

    pub fn sync_calls(&self) -> usize {
        let state = self.state.lock().expect("mutex poisoned");
        state.faults.calls.get(&MemoryOp::Sync).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CloudTransport for MemoryCloud {
    async fn sync(
        &self,
        _local_path: &Path,
        remote_bucket: &str,
    ) -> Result<SyncStats, TransportError> {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.faults.enter(MemoryOp::Sync)?;

        let local = state.local.clone();
        let bucket = state.buckets.entry(remote_bucket.to_string()).or_default();
        let mut stats = SyncStats::default();
        for (key, size) in &local {
            if bucket.get(key) != Some(size) {
                stats.objects_transferred += 1;
                stats.bytes_transferred += size;
            }
        }
        *bucket = local;
        Ok(stats)
    }

    async fn list(&self, remote_bucket: &str) -> Result<Vec<ObjectMeta>, TransportError> {
        let state = self.state.lock().expect("mutex poisoned");
        let now = Utc::now();
        Ok(state
            .buckets
            .get(remote_bucket)
            .map(|objects| {
                objects
                    .iter()
                    .map(|(key, size)| ObjectMeta {
                        key: key.clone(),
                        size: *size,
                        modified_at: now,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
