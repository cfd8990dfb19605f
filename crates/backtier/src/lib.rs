//! Backtier - tiered backup orchestration for snapshot, replication and cloud tiers.

// ============================================================================
// Core Infrastructure
// ============================================================================

pub mod build_info;
pub mod clock;
pub mod config;
pub mod secrets;
pub mod store;
pub mod sync;

// ============================================================================
// Server & HTTP
// ============================================================================

pub mod handlers;
pub mod server;

// ============================================================================
// Domain
// ============================================================================

pub mod alert;
pub mod executor;
pub mod history;
pub mod jobs;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;
pub mod status;
pub mod transport;

// ============================================================================
// Client & Utilities
// ============================================================================

pub mod background;
pub mod client;
pub mod runtime;
