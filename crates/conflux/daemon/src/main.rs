//! Conflux Daemon - runs deployments on this machine
//!
//! The daemon provides:
//! - Schedule-driven dispatch of configured deployments
//! - In-process execution of built-in flows
//! - Crash detection for runs that stop heartbeating

use clap::Parser;
use conflux_daemon::{flows, shutdown_signal, telemetry, DaemonConfig, Worker};
use tokio_util::sync::CancellationToken;

/// Conflux Daemon CLI
#[derive(Parser)]
#[command(name = "confluxd")]
#[command(about = "Conflux Daemon - dispatches and executes flow runs", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONFLUX_CONFIG")]
    config: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "CONFLUX_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "CONFLUX_LOG_JSON")]
    json: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = DaemonConfig::load(cli.config.as_deref())?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    telemetry::init(&level, cli.json || config.logging.json)?;

    let worker = Worker::build(config, flows::builtin()).await?;
    if cli.check {
        println!(
            "configuration ok: {} work pool(s), {} deployment(s)",
            worker.config().work_pools.len(),
            worker.config().deployments.len()
        );
        return Ok(());
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "confluxd starting");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    worker.run(shutdown).await
}
