//! # sheetsync
//!
//! Watches a workbook and mirrors two of its sheets into Google Sheets.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use sheetsync::config::{Config, DEFAULT_CONFIG_FILE};
use sheetsync::{logging, service};

#[derive(Parser, Debug)]
#[command(name = "sheetsync")]
#[command(
    about = "Mirror two sheets of a local workbook into Google Sheets on every save",
    long_about = None
)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).with_context(|| {
        format!("failed to load configuration from {}", args.config.display())
    })?;

    // The service installs its own logging once it knows it has no console
    #[cfg(windows)]
    {
        let dispatched = service::windows::try_run_as_service(&config)
            .context("failed to contact service controller")?;
        if dispatched {
            return Ok(());
        }
    }

    let sink = logging::init(&config);
    tracing::info!(config = %args.config.display(), log = ?sink, "configuration loaded");

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let orchestrator = sheetsync::build_orchestrator(&config).context("invalid watch target")?;
    service::run_foreground(orchestrator).await?;
    tracing::info!("stopped");
    Ok(())
}
