//! nwctl - control tool for the nwwatch collector
//!
//! Writes the shared control state the collector polls once per tick, and
//! shows the current state together with a summary of the published
//! snapshot.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};

use nwwatch_core::{ControlChannel, ControlUpdate};
use nwwatch_database::snapshot::SNAPSHOT_FILENAME;
use nwwatch_database::SnapshotReader;

/// nwctl - nwwatch collector control
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding the control state file
    #[arg(long)]
    control_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show control state and a snapshot summary
    Status {
        /// Data directory holding the published snapshot
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },

    /// Pause command execution (reachability probes continue)
    Pause,

    /// Resume command execution
    Resume,

    /// Ask the collector to finish its current cycle and exit
    Stop,

    /// Clear a previous stop request
    Clear,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let control = ControlChannel::resolve(cli.control_dir.as_deref());

    let result = match cli.command {
        Commands::Status { data_dir } => handle_status(&control, &data_dir).await,
        Commands::Pause => handle_update(&control, ControlUpdate::pause(), "Commands paused").await,
        Commands::Resume => {
            handle_update(&control, ControlUpdate::resume(), "Commands resumed").await
        }
        Commands::Stop => {
            handle_update(&control, ControlUpdate::request_shutdown(), "Shutdown requested").await
        }
        Commands::Clear => {
            handle_update(&control, ControlUpdate::clear_shutdown(), "Shutdown request cleared")
                .await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

async fn handle_update(
    control: &ControlChannel,
    update: ControlUpdate,
    message: &str,
) -> anyhow::Result<()> {
    let state = control
        .write(update)
        .await
        .with_context(|| format!("Failed to write {}", control.path().display()))?;

    info!(path = %control.path().display(), "{}", message);
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn handle_status(control: &ControlChannel, data_dir: &Path) -> anyhow::Result<()> {
    let state = control.read().await;
    let snapshot = snapshot_summary(&data_dir.join(SNAPSHOT_FILENAME)).await?;

    let status = json!({
        "control_file": control.path().display().to_string(),
        "control": state,
        "snapshot": snapshot,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn snapshot_summary(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(Value::Null);
    }

    let reader = SnapshotReader::open(path)
        .await
        .with_context(|| format!("Failed to open snapshot {}", path.display()))?;
    let devices = reader.list_devices().await?;
    let commands = reader.list_commands().await?;

    let mut device_status = Vec::with_capacity(devices.len());
    for device in &devices {
        let last_ping = reader
            .ping_samples_since(&device.name, 0)
            .await?
            .into_iter()
            .next();
        device_status.push(json!({
            "name": device.name,
            "reachable": last_ping.as_ref().map(|p| p.ok),
            "rtt_ms": last_ping.as_ref().and_then(|p| p.rtt_ms),
            "last_ping": last_ping.as_ref().map(|p| p.ts_epoch),
        }));
    }

    reader.close().await?;

    Ok(json!({
        "path": path.display().to_string(),
        "devices": device_status,
        "commands": commands.iter().map(|c| c.command_text.clone()).collect::<Vec<_>>(),
    }))
}
