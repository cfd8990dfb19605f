//! Job descriptor registry.
//!
//! Loaded once from configuration. Any inconsistency (duplicate ids,
//! dangling or cyclic dependencies, bad cadences, unknown retention
//! policies) is reported here so the process refuses to start.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use thiserror::Error;

use super::{Cadence, CadenceError, CadenceZone, Dependency, JobDescriptor, Tier};
use crate::config::JobConfig;
use crate::orchestrator::RetryPolicy;
use crate::retention::RetentionPolicy;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no jobs configured")]
    NoJobs,

    #[error("invalid job id '{0}': use lowercase letters, digits, '-' or '_'")]
    InvalidJobId(String),

    #[error("duplicate job id '{0}'")]
    DuplicateJob(String),

    #[error("job '{job}' depends on tier {tier}, but no job runs on that tier")]
    UnknownDependency { job: String, tier: Tier },

    #[error("job '{job}' cannot depend on its own tier ({tier})")]
    SelfDependency { job: String, tier: Tier },

    #[error("tier dependencies form a cycle through tier {0}")]
    DependencyCycle(Tier),

    #[error("job '{job}' has invalid cadence '{expr}': {source}")]
    InvalidCadence {
        job: String,
        expr: String,
        #[source]
        source: CadenceError,
    },

    #[error("job '{job}' references unknown retention policy '{policy}'")]
    UnknownRetentionPolicy { job: String, policy: String },

    #[error("job '{job}' sets a retention policy, but {tier} jobs leave no dated artifacts")]
    RetentionUnsupported { job: String, tier: Tier },

    #[error("job '{job}' has out-of-range freshness_hours {hours}")]
    InvalidFreshness { job: String, hours: u64 },
}

/// Immutable, validated, ordered set of job descriptors.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Vec<JobDescriptor>,
}

impl JobRegistry {
    /// Build descriptors from configuration and validate them.
    pub fn load(
        configs: &[JobConfig],
        policies: &BTreeMap<String, RetentionPolicy>,
        default_retry: &RetryPolicy,
        zone: CadenceZone,
    ) -> Result<Self, RegistryError> {
        let jobs = configs
            .iter()
            .map(|config| descriptor_from_config(config, default_retry, zone))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(jobs, policies)
    }

    /// Validate already-built descriptors.
    pub fn new(
        jobs: Vec<JobDescriptor>,
        policies: &BTreeMap<String, RetentionPolicy>,
    ) -> Result<Self, RegistryError> {
        if jobs.is_empty() {
            return Err(RegistryError::NoJobs);
        }

        let mut seen = HashSet::new();
        for job in &jobs {
            if !is_valid_job_id(&job.id) {
                return Err(RegistryError::InvalidJobId(job.id.clone()));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(RegistryError::DuplicateJob(job.id.clone()));
            }
        }

        let tiers: BTreeSet<Tier> = jobs.iter().map(|j| j.tier).collect();
        let mut edges: BTreeMap<Tier, BTreeSet<Tier>> = BTreeMap::new();
        for job in &jobs {
            if let Some(dep) = job.depends_on {
                if dep.tier == job.tier {
                    return Err(RegistryError::SelfDependency {
                        job: job.id.clone(),
                        tier: dep.tier,
                    });
                }
                if !tiers.contains(&dep.tier) {
                    return Err(RegistryError::UnknownDependency {
                        job: job.id.clone(),
                        tier: dep.tier,
                    });
                }
                edges.entry(job.tier).or_default().insert(dep.tier);
            }

            if let Some(policy) = &job.retention {
                if !policies.contains_key(policy) {
                    return Err(RegistryError::UnknownRetentionPolicy {
                        job: job.id.clone(),
                        policy: policy.clone(),
                    });
                }
                if !job.tier.has_dated_artifacts() {
                    return Err(RegistryError::RetentionUnsupported {
                        job: job.id.clone(),
                        tier: job.tier,
                    });
                }
            }
        }

        if let Some(tier) = find_cycle(&edges) {
            return Err(RegistryError::DependencyCycle(tier));
        }

        Ok(Self { jobs })
    }

    /// All jobs in configuration order.
    pub fn list_jobs(&self) -> &[JobDescriptor] {
        &self.jobs
    }

    pub fn get(&self, id: &str) -> Option<&JobDescriptor> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Jobs that the scheduler fires.
    pub fn enabled(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.iter().filter(|j| j.enabled)
    }

    pub fn in_tier(&self, tier: Tier) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.iter().filter(move |j| j.tier == tier)
    }

    /// Jobs whose dependency points at `tier`.
    pub fn downstream_of(&self, tier: Tier) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs
            .iter()
            .filter(move |j| j.depends_on.is_some_and(|d| d.tier == tier))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn descriptor_from_config(
    config: &JobConfig,
    default_retry: &RetryPolicy,
    zone: CadenceZone,
) -> Result<JobDescriptor, RegistryError> {
    let cadence =
        Cadence::parse_in(&config.cadence, zone).map_err(|source| RegistryError::InvalidCadence {
            job: config.id.clone(),
            expr: config.cadence.clone(),
            source,
        })?;

    let depends_on = match &config.depends_on {
        Some(d) => {
            let freshness = i64::try_from(d.freshness_hours)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .ok_or_else(|| RegistryError::InvalidFreshness {
                    job: config.id.clone(),
                    hours: d.freshness_hours,
                })?;
            Some(Dependency {
                tier: d.tier,
                freshness,
            })
        }
        None => None,
    };

    Ok(JobDescriptor {
        id: config.id.clone(),
        name: config.name.clone().unwrap_or_else(|| config.id.clone()),
        tier: config.tier,
        cadence,
        depends_on,
        retention: config.retention.clone(),
        label: config.label.clone(),
        attempt_timeout: config
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.tier.default_attempt_timeout()),
        retry: config.retry.clone().unwrap_or_else(|| default_retry.clone()),
        enabled: config.enabled,
    })
}

fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Returns a tier that can reach itself through dependency edges.
fn find_cycle(edges: &BTreeMap<Tier, BTreeSet<Tier>>) -> Option<Tier> {
    for &start in edges.keys() {
        let mut stack: Vec<Tier> = edges[&start].iter().copied().collect();
        let mut visited = BTreeSet::new();
        while let Some(tier) = stack.pop() {
            if tier == start {
                return Some(start);
            }
            if visited.insert(tier)
                && let Some(next) = edges.get(&tier)
            {
                stack.extend(next.iter().copied());
            }
        }
    }
    None
}
