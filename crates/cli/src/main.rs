//! meshconf CLI - Main Entry Point
//!
//! Operator interface to the node store: inspect and edit node records,
//! register nodes and answer config requests by hand.

use clap::{Parser, Subcommand};
use meshconf_common::{NodeStore, SqliteKv, StoreOptions};
use std::path::PathBuf;
use std::sync::Arc;

mod commands;
mod output;

use commands::{admin, node, request};

/// meshconf CLI - mesh node configuration store
#[derive(Parser)]
#[command(name = "meshconf")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Node database path
    #[arg(long, env = "MESHCONF_DB", global = true)]
    db: Option<PathBuf>,

    /// Key prefix of node records
    #[arg(long, default_value = meshconf_common::store::DEFAULT_CONFIG_PREFIX, global = true)]
    prefix: String,

    /// Key of the identifier counter
    #[arg(long, default_value = meshconf_common::store::DEFAULT_COUNTER_KEY, global = true)]
    counter_key: String,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and edit node records
    #[command(subcommand)]
    Node(node::NodeCommands),

    // init, show-overrides
    #[command(flatten)]
    Admin(admin::AdminCommands),

    /// Config requests and signing keys
    #[command(subcommand)]
    Request(request::RequestCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("meshconf CLI v{}", meshconf_common::VERSION);
        return Ok(());
    }

    let db_path = cli.db.unwrap_or_else(meshconf_common::default_db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let kv = Arc::new(SqliteKv::open(&db_path)?);
    let store = NodeStore::with_options(
        kv,
        StoreOptions {
            config_prefix: cli.prefix,
            counter_key: cli.counter_key,
            ..Default::default()
        },
    )?;

    match cli.command {
        Commands::Node(cmd) => node::execute(cmd, store, cli.format).await?,
        Commands::Admin(cmd) => admin::execute(cmd, store, cli.format).await?,
        Commands::Request(cmd) => request::execute(cmd, store, cli.format).await?,
        Commands::Version => {}
    }

    Ok(())
}
