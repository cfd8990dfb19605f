//! Job scheduling.
//!
//! [`SchedulerService`] owns the coordination loop and the per-job
//! execution locks; [`SchedulerHandle`] triggers runs and shuts the loop
//! down. [`SchedulerState`] is the read-only view the status reporter uses.

mod error;
mod service;
mod state;

pub use error::{Result, SchedulerError};
pub use service::{SchedulerHandle, SchedulerService, TriggerOutcome};
pub use state::{JobState, SchedulerState};
