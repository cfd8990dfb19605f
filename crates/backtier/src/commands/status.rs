//! `backtier status`: query a running daemon.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use backtier::client::BacktierClient;

pub async fn run(server: &str, json: bool) -> Result<()> {
    let client = BacktierClient::new(server);
    let report = client
        .status()
        .await
        .with_context(|| format!("Failed to query {server}"))?;

    if json {
        let raw = serde_json::json!({
            "status": report.status,
            "uptime_seconds": report.uptime_seconds,
            "last_heartbeat": report.last_heartbeat,
            "jobs": report.jobs.iter().map(|j| serde_json::json!({
                "id": j.id,
                "last_run": j.last_run,
                "next_run": j.next_run,
                "last_outcome": j.last_outcome,
                "last_error": j.last_error,
                "running": j.running,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&raw)?);
        return Ok(());
    }

    println!(
        "{} {} ({}), up {}s, last heartbeat {}{}",
        report.version.service,
        report.version.version,
        report.status,
        report.uptime_seconds,
        fmt_time(report.last_heartbeat),
        if report.scheduler_stale { " [STALE]" } else { "" },
    );
    println!();
    println!(
        "{:<20} {:<5} {:<9} {:<26} {:<26} ERROR",
        "JOB", "TIER", "OUTCOME", "LAST RUN", "NEXT RUN"
    );
    for job in &report.jobs {
        let outcome = if job.running {
            "running"
        } else {
            job.last_outcome.as_deref().unwrap_or("-")
        };
        println!(
            "{:<20} {:<5} {:<9} {:<26} {:<26} {}",
            job.id,
            job.tier,
            outcome,
            fmt_time(job.last_run),
            if job.enabled { fmt_time(job.next_run) } else { "disabled".to_string() },
            job.last_error.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}
