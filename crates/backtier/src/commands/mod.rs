//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result};

use backtier::config::Config;
use backtier::runtime::Runtime;

pub mod check;
pub mod retention;
pub mod run;
pub mod serve;
pub mod status;
pub mod stop;

/// Load configuration and build the runtime. Configuration and registry
/// errors are fatal.
pub async fn load_runtime(config_path: &str) -> Result<Runtime> {
    let config = Config::load(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;
    Runtime::build(config, Path::new(config_path))
        .await
        .context("Invalid configuration")
}
