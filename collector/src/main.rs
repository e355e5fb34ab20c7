//! nwwatch collector
//!
//! Collects command output and reachability data from network devices and
//! publishes it as an atomically replaced SQLite snapshot.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{info, instrument};

mod collector;
mod config;

use collector::Collector;
use config::Config;
use nwwatch_core::ControlChannel;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// nwwatch collector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", env = "NWWATCH_CONFIG")]
    config: PathBuf,

    /// Directory for session databases and the published snapshot
    /// (overrides `data_dir` from the configuration)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory holding the control state file
    #[arg(long)]
    control_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,collector=debug".into());

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
#[instrument]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Parse CLI args
    let args = Args::parse();
    init_tracing(args.log_format);

    // Load configuration
    let config = Config::load(&args.config)
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;
    let data_dir = args.data_dir.unwrap_or_else(|| config.data_dir.clone());
    let control = ControlChannel::resolve(args.control_dir.as_deref());

    info!(
        config = %args.config.display(),
        data_dir = %data_dir.display(),
        control = %control.path().display(),
        devices = config.devices.len(),
        commands = config.commands.len(),
        "Starting nwwatch collector"
    );

    let collector = Collector::new(&config, &data_dir, control)
        .await
        .context("Failed to initialise collector")?;
    info!(
        snapshot = %collector.publisher().snapshot_path().display(),
        "Publishing snapshots"
    );

    collector
        .run(shutdown_signal())
        .await
        .context("Collector failed")?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
