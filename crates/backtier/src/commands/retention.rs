//! `backtier retention`: dry run of a job's retention policy.

use anyhow::{Context, Result};

pub async fn run(job_id: &str, config_path: &str) -> Result<()> {
    let runtime = super::load_runtime(config_path).await?;
    let job = runtime
        .registry
        .get(job_id)
        .with_context(|| format!("Unknown job '{job_id}'"))?;

    let Some(plan) = runtime
        .orchestrator
        .plan_retention(job)
        .await
        .context("Failed to evaluate retention")?
    else {
        println!("{job_id} has no retention policy for its tier");
        return Ok(());
    };

    let policy = job.retention.as_deref().unwrap_or("-");
    println!(
        "{job_id}: policy '{policy}', {} artifacts, {} kept, {} would be deleted",
        plan.artifacts.len(),
        plan.kept(),
        plan.doomed.len()
    );
    for artifact in &plan.artifacts {
        let mark = if plan.doomed.contains(&artifact.id) {
            "delete"
        } else if plan.protected.contains(&artifact.id) {
            "protected"
        } else {
            "keep"
        };
        println!(
            "  {:<10} {}  {}",
            mark,
            artifact.created_at.format("%Y-%m-%d %H:%M"),
            artifact.id
        );
    }
    Ok(())
}
