//! `backtier run`: one job in the foreground.

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use backtier::history::{Trigger, new_run_id};

pub async fn run(job_id: &str, config_path: &str) -> Result<()> {
    let runtime = super::load_runtime(config_path).await?;
    let job = runtime
        .registry
        .get(job_id)
        .with_context(|| format!("Unknown job '{job_id}'"))?
        .clone();

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, interrupting run...");
                cancel.cancel();
            }
        })
    };

    let record = runtime
        .orchestrator
        .run_job(&job, new_run_id(), Trigger::Manual, &cancel)
        .await;
    ctrl_c.abort();

    println!("{}", serde_json::to_string_pretty(&*record)?);

    if !record.is_success() {
        let reason = record
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| record.outcome.as_str().to_string());
        bail!("Job {job_id} did not succeed: {reason}");
    }
    Ok(())
}
