//! vigil-daemon entry point.
//!
//! Loads environment-driven configuration, initializes logging and the
//! metrics endpoint, builds the pipeline, and runs until SIGTERM/SIGINT.
//! The pipeline owns its own data-plane threads; the main thread only
//! waits for shutdown signals.

mod logging;
mod metrics_server;

use anyhow::{Context, Result};
use clap::Parser;

use vigil_core::config::VigilConfig;
use vigil_pipeline::PipelineBuilder;

/// High-throughput log ingestion, scoring, and active-defense pipeline.
#[derive(Debug, Parser)]
#[command(name = "vigild", version, about)]
struct Cli {
    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate configuration, print the effective values, and exit
    #[arg(long)]
    config_check: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = VigilConfig::from_env().context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }

    if cli.config_check {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vigil-daemon starting");

    if config.metrics.enabled {
        metrics_server::install_metrics_recorder(&config.metrics)?;
    }

    // Component construction failure at startup is fatal
    let mut pipeline = PipelineBuilder::new(config)
        .build()
        .context("failed to build pipeline")?;
    pipeline
        .start()
        .context("failed to start pipeline")?;
    tracing::info!("vigil-daemon running");

    let signal = wait_for_shutdown_signal()?;
    tracing::info!(signal, "shutdown signal received");

    // stop() joins both data-plane threads and flushes in-flight batches
    pipeline.stop();
    tracing::info!("vigil-daemon shut down");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Runs a minimal current-thread runtime just for signal handling; the
/// data plane never touches this runtime.
///
/// # Errors
///
/// Returns an error if signal handlers cannot be installed.
fn wait_for_shutdown_signal() -> Result<&'static str> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build signal runtime")?;

    runtime.block_on(async {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

        Ok(tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        })
    })
}
