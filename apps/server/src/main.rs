//! mediad server - standalone media control-plane daemon.
//!
//! Hosts the focus arbiter, session mediator, player/recorder registry and
//! policy store behind the framed RPC protocol, for clients on this CPU
//! and on peers.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mediad_core::Daemon;
use tokio::signal;

use crate::config::ServerConfig;

/// mediad server - media control-plane daemon.
#[derive(Parser, Debug)]
#[command(name = "mediad-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "MEDIAD_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// CPU name (overrides config file).
    #[arg(long, env = "MEDIAD_CPU")]
    cpu: Option<String>,

    /// Cross-CPU RPC port (overrides config file).
    #[arg(short = 'p', long, env = "MEDIAD_RPC_PORT")]
    rpc_port: Option<i32>,

    /// File backing persisted criteria.
    #[arg(long, env = "MEDIAD_PERSIST_FILE")]
    persist_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("mediad server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(cpu) = args.cpu {
        config.cpu = cpu;
    }
    if let Some(port) = args.rpc_port {
        config.rpc_port = port;
    }
    if let Some(persist_file) = args.persist_file {
        config.persist_file = Some(persist_file);
    }

    log::info!(
        "Configuration: cpu={}, socket_dir={}, rpc_port={}",
        config.cpu,
        config.socket_dir.display(),
        config.rpc_port
    );

    let daemon = Daemon::start(config.to_core_config())
        .await
        .context("Failed to start daemon")?;

    signal::ctrl_c().await.context("Failed to wait for ctrl-c")?;
    log::info!(
        "Shutting down ({} active connections)",
        daemon.active_connections()
    );
    daemon.shutdown();

    Ok(())
}
