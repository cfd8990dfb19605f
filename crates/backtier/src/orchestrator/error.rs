use thiserror::Error;

use crate::history::ErrorKind;
use crate::jobs::Tier;

/// Why a run ended without success.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no successful {tier} run within the last {freshness_hours}h")]
    DependencyUnsatisfied { tier: Tier, freshness_hours: i64 },

    #[error("gave up after {attempts} attempts: {detail}")]
    TransientExecutionFailure { attempts: u32, detail: String },

    #[error("permanent failure: {detail}")]
    PermanentExecutionFailure { detail: String },

    #[error("run panicked: {0}")]
    Panicked(String),

    #[error("interrupted by shutdown")]
    Interrupted,
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::DependencyUnsatisfied { .. } => ErrorKind::DependencyUnsatisfied,
            JobError::TransientExecutionFailure { .. } => ErrorKind::TransientExecutionFailure,
            JobError::PermanentExecutionFailure { .. } => ErrorKind::PermanentExecutionFailure,
            JobError::Panicked(_) => ErrorKind::Panicked,
            JobError::Interrupted => ErrorKind::Interrupted,
        }
    }
}
