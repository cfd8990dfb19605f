//! Job descriptors: what runs, on which tier, how often, and after what.
//!
//! Descriptors are built once at startup from configuration by the
//! [`JobRegistry`] and are immutable afterwards.

mod cadence;
mod registry;

pub use cadence::{Cadence, CadenceError, CadenceZone};
pub use registry::{JobRegistry, RegistryError};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::RetryPolicy;

/// Job identifier (a slug such as `snapshot-daily`).
pub type JobId = String;

// ============================================================================
// Tier
// ============================================================================

/// One stage of the backup chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "TierRepr", into = "u8")]
pub enum Tier {
    /// Local filesystem snapshot.
    Snapshot = 1,
    /// Off-host copy of local snapshots.
    Replication = 2,
    /// Object-storage mirror.
    Cloud = 3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Snapshot, Tier::Replication, Tier::Cloud];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Tier::Snapshot => "snapshot",
            Tier::Replication => "replication",
            Tier::Cloud => "cloud",
        }
    }

    /// Per-attempt timeout used when a job does not set one.
    pub fn default_attempt_timeout(self) -> Duration {
        match self {
            Tier::Snapshot => Duration::from_secs(300),
            Tier::Replication => Duration::from_secs(7200),
            Tier::Cloud => Duration::from_secs(7200),
        }
    }

    /// Whether the tier leaves a dated artifact set behind that retention can prune.
    pub fn has_dated_artifacts(self) -> bool {
        !matches!(self, Tier::Cloud)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.id()
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Tier::Snapshot),
            2 => Ok(Tier::Replication),
            3 => Ok(Tier::Cloud),
            other => Err(format!("unknown tier {other}, expected 1, 2 or 3")),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "snapshot" => Ok(Tier::Snapshot),
            "2" | "replication" => Ok(Tier::Replication),
            "3" | "cloud" => Ok(Tier::Cloud),
            other => Err(format!(
                "unknown tier '{other}', expected snapshot, replication or cloud"
            )),
        }
    }
}

/// Tiers are written either by number or by name in configuration.
#[derive(Deserialize)]
#[serde(untagged)]
enum TierRepr {
    Id(u8),
    Name(String),
}

impl TryFrom<TierRepr> for Tier {
    type Error = String;

    fn try_from(repr: TierRepr) -> Result<Self, Self::Error> {
        match repr {
            TierRepr::Id(id) => Tier::try_from(id),
            TierRepr::Name(name) => name.parse(),
        }
    }
}

// ============================================================================
// JobDescriptor
// ============================================================================

/// Upstream requirement: some job in `tier` must have succeeded within `freshness`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub tier: Tier,
    pub freshness: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub id: JobId,
    /// Human-readable name used in alerts and status.
    pub name: String,
    pub tier: Tier,
    pub cadence: Cadence,
    pub depends_on: Option<Dependency>,
    /// Name of the retention policy applied after a successful run.
    pub retention: Option<String>,
    /// Marker embedded in artifact names (e.g. `daily`).
    pub label: Option<String>,
    /// Hard limit on one attempt.
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    /// Disabled jobs are validated but never fired.
    pub enabled: bool,
}
