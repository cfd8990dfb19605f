//! Persistence for run history.
//!
//! ```text
//! RunHistory (in-memory index, history/)
//!     └── RunLogStore (trait)
//!             └── FileRunLogStore  {workspace}/runs/{job_id}.jsonl
//! ```
//!
//! Store methods follow `load_*` / `append` / `delete` naming.

pub mod error;
pub mod file;
mod run_log;

pub use error::{StorageError, StorageResult};
pub use run_log::RunLogStore;
