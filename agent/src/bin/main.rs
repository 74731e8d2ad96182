//! Entry point of the collection agent.
//!
//! The agent owns the builtin pipelines; user pipelines are handed to the
//! manager by the configuration loader through the staging slots.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sluice::config::AgentConfig;
use sluice::manager::PipelineManager;

#[derive(Parser)]
#[command(name = "sluice-agent", version, about)]
struct Cli {
    /// Path to the agent configuration file (TOML). Defaults are used when
    /// no file is given.
    #[arg(long, short, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    sluice::util::panic::install_panic_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<AgentConfig>(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => AgentConfig::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;
    let manager = Arc::new(PipelineManager::new(config, rt.handle().clone()));
    rt.block_on(run(manager))
}

async fn run(manager: Arc<PipelineManager>) -> anyhow::Result<()> {
    manager.init().context("agent init failed")?;
    log::info!("agent started, waiting for a shutdown signal");
    wait_for_signal().await?;

    log::info!("agent shutting down");
    // Input-owning pipelines first, so nothing produces new data while the
    // rest of the chain drains.
    let _ = manager.stop_all_pipelines(true).await;
    let _ = manager.stop_all_pipelines(false).await;
    manager.stop_builtin_modules().await;
    log::info!("agent stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).context("failed to install the SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")
}
