//! Retention policy engine.
//!
//! [`prune_targets`] is a pure function from a dated artifact list and a
//! policy to the set of artifact ids to delete. Artifacts are bucketed
//! (daily/weekly/monthly), grouped by period within their bucket (day, ISO
//! week, month) and the newest artifact of each of the N most recent periods
//! is kept. The newest artifact overall is always kept, as is anything the
//! caller protects, and deletions are withdrawn (newest first) until the
//! survivor count reaches the policy floor.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

// ============================================================================
// Types
// ============================================================================

/// A dated artifact produced by a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Daily,
    Weekly,
    Monthly,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Daily, Bucket::Weekly, Bucket::Monthly];

    fn marker(self) -> &'static str {
        match self {
            Bucket::Daily => "daily",
            Bucket::Weekly => "weekly",
            Bucket::Monthly => "monthly",
        }
    }

    /// Period key: artifacts sharing a key compete for one slot.
    fn period(self, at: DateTime<Utc>) -> (i32, u32) {
        match self {
            Bucket::Daily => (at.year(), at.ordinal()),
            Bucket::Weekly => {
                let week = at.iso_week();
                (week.year(), week.week())
            }
            Bucket::Monthly => (at.year(), at.month()),
        }
    }
}

/// How artifacts are assigned to buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classifier {
    /// By the name prefix (`daily-`, `weekly-`, `monthly-`). Unmarked is daily.
    #[default]
    Marker,
    /// By the creation date: 1st of month is monthly, Sunday is weekly.
    Calendar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_daily")]
    pub daily: usize,
    #[serde(default = "default_weekly")]
    pub weekly: usize,
    #[serde(default = "default_monthly")]
    pub monthly: usize,
    /// Never leave fewer than this many artifacts.
    #[serde(default = "default_floor")]
    pub floor: usize,
    #[serde(default)]
    pub classify: Classifier,
}

fn default_daily() -> usize {
    7
}

fn default_weekly() -> usize {
    4
}

fn default_monthly() -> usize {
    12
}

fn default_floor() -> usize {
    1
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: default_daily(),
            weekly: default_weekly(),
            monthly: default_monthly(),
            floor: default_floor(),
            classify: Classifier::default(),
        }
    }
}

impl RetentionPolicy {
    pub fn keep_count(&self, bucket: Bucket) -> usize {
        match bucket {
            Bucket::Daily => self.daily,
            Bucket::Weekly => self.weekly,
            Bucket::Monthly => self.monthly,
        }
    }

    pub fn classify(&self, artifact: &Artifact) -> Bucket {
        match self.classify {
            Classifier::Marker => classify_by_marker(&artifact.id),
            Classifier::Calendar => classify_by_calendar(artifact.created_at),
        }
    }
}

fn classify_by_marker(id: &str) -> Bucket {
    // Snapshot ids may be qualified with their dataset (`pool/ds@daily-...`).
    let name = id.rsplit_once('@').map_or(id, |(_, name)| name);
    let name = name.to_ascii_lowercase();
    Bucket::ALL
        .into_iter()
        .rev()
        .find(|bucket| {
            name.strip_prefix(bucket.marker())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(['-', '_', '.']))
        })
        .unwrap_or(Bucket::Daily)
}

fn classify_by_calendar(at: DateTime<Utc>) -> Bucket {
    if at.day() == 1 {
        Bucket::Monthly
    } else if at.weekday() == Weekday::Sun {
        Bucket::Weekly
    } else {
        Bucket::Daily
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Ids from `existing` that `policy` says to delete.
pub fn prune_targets(existing: &[Artifact], policy: &RetentionPolicy) -> BTreeSet<String> {
    prune_targets_protecting(existing, policy, &HashSet::new())
}

/// Like [`prune_targets`], but never selects an id in `protected`.
pub fn prune_targets_protecting(
    existing: &[Artifact],
    policy: &RetentionPolicy,
    protected: &HashSet<String>,
) -> BTreeSet<String> {
    // Newest first; equal timestamps ordered by id so output never depends on input order.
    let mut sorted: Vec<&Artifact> = existing.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    sorted.dedup_by(|a, b| a.id == b.id);

    let Some(newest) = sorted.first() else {
        return BTreeSet::new();
    };

    let mut keep: HashSet<&str> = HashSet::new();
    keep.insert(newest.id.as_str());
    keep.extend(protected.iter().map(String::as_str));

    for bucket in Bucket::ALL {
        let limit = policy.keep_count(bucket);
        let mut periods = BTreeSet::new();
        for artifact in sorted.iter().filter(|a| policy.classify(a) == bucket) {
            if periods.len() >= limit {
                break;
            }
            if periods.insert(bucket.period(artifact.created_at)) {
                keep.insert(artifact.id.as_str());
            }
        }
    }

    let mut candidates: Vec<&str> = sorted
        .iter()
        .map(|a| a.id.as_str())
        .filter(|id| !keep.contains(id))
        .collect();

    // Candidates are newest first, so restoring from the front keeps the freshest.
    let survivors = sorted.len() - candidates.len();
    let shortfall = policy.floor.saturating_sub(survivors).min(candidates.len());
    candidates.drain(..shortfall);

    candidates.into_iter().map(str::to_string).collect()
}

// ============================================================================
// Errors
// ============================================================================

/// Retention errors are logged by the orchestrator and never fail a job.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("failed to list artifacts: {0}")]
    List(#[source] TransportError),

    #[error("failed to delete {failed} of {planned} artifacts (first: {first_id}: {first_error})")]
    Delete {
        planned: usize,
        failed: usize,
        first_id: String,
        first_error: TransportError,
    },

    #[error("retention did not finish within {}s", .0.as_secs())]
    TimedOut(std::time::Duration),

    #[error("retention interrupted by shutdown")]
    Interrupted,
}
