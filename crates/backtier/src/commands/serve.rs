//! Daemon: scheduler loop plus the HTTP status surface.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{info, warn};

use backtier::config::Config;
use backtier::runtime::Runtime;
use backtier::server;

pub async fn run(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    // CLI overrides config
    if let Some(host) = host_override {
        config.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let runtime = Runtime::build(config, Path::new(config_path))
        .await
        .context("Invalid configuration")?;

    let scheduler = runtime.scheduler().start();
    info!(jobs = runtime.registry.len(), "Scheduler service started");

    let (shutdown_tx, shutdown_rx) = server::shutdown_channel();
    let state = server::AppState {
        status: runtime.status_reporter(Some(&scheduler)),
        history: runtime.history.clone(),
        scheduler: Some(scheduler.clone()),
        admin_token: non_empty(&runtime.config.server.admin_token),
        api_token: non_empty(&runtime.config.server.api_token),
        heartbeat_seconds: runtime.config.scheduler.heartbeat_seconds,
        started_at: Instant::now(),
        shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
    };
    let app = server::build_app(
        state,
        runtime.config.server.request_timeout_seconds,
        runtime.config.server.max_connections.max(1),
    );

    let ip: IpAddr = runtime
        .config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid server.host '{}'", runtime.config.server.host))?;
    let addr = SocketAddr::new(ip, runtime.config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(addr = %addr, "Starting server");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_rx))
    .await?;

    // In-flight runs get the grace period, then are aborted and recorded
    // as interrupted.
    scheduler.shutdown().await;

    info!("Server stopped");
    Ok(())
}

/// `${VAR:-}` leaves an empty token, which must not count as configured.
fn non_empty(token: &Option<String>) -> Option<String> {
    token.clone().filter(|t| !t.is_empty())
}

async fn shutdown_signal(http_shutdown: tokio::sync::oneshot::Receiver<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
        _ = http_shutdown => info!("Received shutdown request via HTTP, shutting down..."),
    }
}
