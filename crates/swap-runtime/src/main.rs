//! # Atomic Swap Runtime
//!
//! Entry point for the swap engine daemon.
//!
//! ```text
//! swap-runtime --config swap.toml
//! SWAP_CONFIG=swap.toml SWAP_CLAIM_KEY=... swap-runtime
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use swap_runtime::{RuntimeConfig, SwapRuntime};
use swap_telemetry::{init_telemetry, TelemetryConfig};
use tracing::info;

/// Cross-chain HTLC atomic swap engine
#[derive(Parser, Debug)]
#[command(name = "swap-runtime")]
#[command(about = "Cross-chain HTLC atomic swap engine", long_about = None)]
struct Args {
    /// TOML configuration file (falls back to SWAP_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulate claims without broadcasting
    #[arg(long)]
    dry_run: bool,

    /// Snapshot file, overriding the configuration
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let telemetry = TelemetryConfig::from_env();
    init_telemetry(&telemetry).context("failed to initialize telemetry")?;

    let path = args.config.or_else(|| std::env::var_os("SWAP_CONFIG").map(PathBuf::from));
    let mut config = RuntimeConfig::load(path.as_deref()).context("failed to load configuration")?;
    if args.dry_run {
        config.engine.scheduler.dry_run = true;
    }
    if let Some(snapshot) = args.snapshot {
        config.snapshot_path = Some(snapshot);
    }
    if config.metrics_addr.is_none() {
        config.metrics_addr = Some(SocketAddr::from(([0, 0, 0, 0], telemetry.metrics_port)));
    }
    if args.check {
        println!("{}", toml::to_string_pretty(&config).context("failed to render configuration")?);
        return Ok(());
    }

    let runtime = SwapRuntime::new(config)?;
    runtime.start().await?;

    info!("[runtime] running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    runtime.shutdown().await
}
