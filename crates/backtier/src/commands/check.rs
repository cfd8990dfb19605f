//! `backtier check`: validate configuration and preview the schedule.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use backtier::config::Config;
use backtier::runtime;

pub async fn run(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if !path.exists() {
        println!("{config_path} not found, checking the default configuration");
    }

    let config = Config::load(path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;
    config.validate().context("Invalid configuration")?;
    let registry = runtime::build_registry(&config).context("Invalid job definitions")?;

    let now = Utc::now();
    println!(
        "{:<20} {:<12} {:<16} {:<8} NEXT RUN",
        "JOB", "TIER", "CADENCE", "ENABLED"
    );
    for job in registry.list_jobs() {
        let next = if job.enabled {
            job.cadence
                .next_after(now)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        } else {
            "-".to_string()
        };
        println!(
            "{:<20} {:<12} {:<16} {:<8} {}",
            job.id,
            format!("{} ({})", job.tier.id(), job.tier),
            job.cadence.expr(),
            if job.enabled { "yes" } else { "no" },
            next
        );
        if let Some(dep) = &job.depends_on {
            println!(
                "{:<20} depends on tier {} within {}h",
                "",
                dep.tier,
                dep.freshness.num_hours()
            );
        }
    }

    println!("\nConfiguration OK ({} jobs)", registry.len());
    Ok(())
}
