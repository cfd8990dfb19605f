use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
