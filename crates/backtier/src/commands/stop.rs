//! `backtier stop`: ask a running daemon to shut down.

use anyhow::{Context, Result, bail};

use backtier::client::BacktierClient;

pub async fn run(server: &str, token: Option<String>) -> Result<()> {
    let client = BacktierClient::new(server).with_token(token);

    if client.health().await.is_err() {
        bail!("No server running at {server}");
    }

    client.shutdown().await.context("Failed to stop server")?;

    println!("Shutdown initiated for server at {server}");
    Ok(())
}
