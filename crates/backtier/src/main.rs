mod commands;

use std::net::IpAddr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use backtier::config::DEFAULT_CONFIG_FILE;

// ============================================================================
// CLI Types
// ============================================================================

/// Backtier - tiered backup orchestration for snapshots, replication and cloud sync
#[derive(Parser, Debug)]
#[command(version = backtier::build_info::VERSION, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler and the HTTP status server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,

        /// Host to bind to (overrides config file)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate configuration and print each job's next fire time
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },

    /// Run one job now, in the foreground
    Run {
        /// Job to run
        #[arg(value_name = "JOB_ID")]
        job_id: String,

        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },

    /// Show job status from a running server
    Status {
        /// Server URL
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Stop a running server
    Stop {
        /// Server URL
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Admin bearer token (defaults to $BACKTIER_ADMIN_TOKEN)
        #[arg(long, env = "BACKTIER_ADMIN_TOKEN")]
        token: Option<String>,
    },

    /// List the artifacts a job's retention policy would delete
    Retention {
        /// Job whose artifacts to evaluate
        #[arg(value_name = "JOB_ID")]
        job_id: String,

        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => commands::serve::run(&config, host, port).await,
        Commands::Check { config } => commands::check::run(&config).await,
        Commands::Run { job_id, config } => commands::run::run(&job_id, &config).await,
        Commands::Status { server, json } => commands::status::run(&server, json).await,
        Commands::Stop { server, token } => commands::stop::run(&server, token).await,
        Commands::Retention { job_id, config } => {
            commands::retention::run(&job_id, &config).await
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
