//! wsscan backend entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "wsscan-backend",
    author,
    version,
    about = "WebSocket upload endpoint that runs the Unified Agent scan engine"
)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "WSSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured listen port.
    #[arg(long, env = "WSSCAN_PORT")]
    port: Option<u16>,

    /// Overrides the number of engine processes allowed at once.
    #[arg(long)]
    workers: Option<usize>,

    /// Overrides the scratch directory root.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting wsscan backend");

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workers) = cli.workers {
        config.max_concurrent_scans = workers;
    }
    if let Some(dir) = cli.scratch_dir {
        config.scratch_dir = dir;
    }
    config.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("backend shut down cleanly");
    Ok(())
}
