//! meshconf Daemon
//!
//! Keeps the peers of the node tunnel device in line with the node store.

use clap::Parser;
use meshconf_common::{NodeStore, SqliteKv};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod device;
mod reconciler;

use config::DaemonConfig;
use device::UapiDevice;
use reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "meshconfd")]
#[command(about = "meshconf daemon - reconciles WireGuard peers against the node store")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MESHCONF_CONFIG", default_value = "/etc/meshconf/meshconfd.toml")]
    config: PathBuf,

    /// Node database path
    #[arg(long, env = "MESHCONF_DB")]
    db: Option<PathBuf>,

    /// Tunnel device name
    #[arg(long)]
    device: Option<String>,

    /// Directory holding the device control sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Seconds between reconcile passes
    #[arg(short, long)]
    interval: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(clap::Subcommand)]
enum Mode {
    /// Print the pending peer changes once and exit without applying them
    Simulate,
    /// Write the effective configuration to the config file and exit
    WriteConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("meshconf daemon v{}", meshconf_common::VERSION);

    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.store.db_path = db;
    }
    if let Some(device) = cli.device {
        config.device.name = device;
    }
    if let Some(socket_dir) = cli.socket_dir {
        config.device.socket_dir = socket_dir;
    }
    if let Some(interval) = cli.interval {
        config.reconcile.interval_secs = interval;
    }

    if let Some(Mode::WriteConfig) = cli.mode {
        config.save(&cli.config)?;
        info!("Wrote configuration to {:?}", cli.config);
        return Ok(());
    }

    if let Some(parent) = config.store.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let kv = Arc::new(SqliteKv::open(&config.store.db_path)?);
    let store = NodeStore::with_options(kv, config.store.options())?;

    let device = Arc::new(UapiDevice::new(
        config.device.name.clone(),
        config.device.socket_path(),
    ));
    info!(
        "Managing {} via {:?}",
        device.name(),
        device.socket_path()
    );

    let reconciler = Reconciler::new(store, device, config.reconcile.interval());

    if let Some(Mode::Simulate) = cli.mode {
        let changes = reconciler.plan().await?;
        println!("Peer updates ({}):", changes.len());
        for change in &changes {
            println!("  {change}");
        }
        return Ok(());
    }

    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                error!("Reconciler error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
