//! habctld
//!
//! Loads the configuration, activates the controllers flagged
//! `activate_on_start` and runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use hc_daemon::{DaemonBuilder, DEFAULT_SHUTDOWN_GRACE};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "habctld", version, about = "habctl controller daemon")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/habctl/habctl.yaml")]
    config: PathBuf,

    /// Log filter, overriding the configured level (RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = hc_config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.check {
        println!(
            "{}: {} output(s), {} controller(s), {} action(s)",
            cli.config.display(),
            config.outputs.len(),
            config.controllers.len(),
            config.actions.len()
        );
        return Ok(());
    }

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(config = %cli.config.display(), "Starting habctld");
    let daemon = DaemonBuilder::new(config).build();
    daemon.start().await;

    tokio::signal::ctrl_c().await?;
    daemon.shutdown(DEFAULT_SHUTDOWN_GRACE).await;
    Ok(())
}
