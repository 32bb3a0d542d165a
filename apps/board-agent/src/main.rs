//! AstroPi board agent entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Headless camera service for the AstroPi.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (created with defaults if missing).
    #[arg(short, long, env = "ASTROPI_BOARD_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting AstroPi board agent"
    );

    let path = cli.config.unwrap_or_else(config::default_path);
    let config = config::Config::load(&path)?;
    tracing::info!(name = %config.name, path = %path.display(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("board agent shut down cleanly");
    Ok(())
}
