mod args;
mod runner;

use anyhow::Result;
use clap::Parser;
use purplecheck_core::config::EngineConfig;
use tracing_subscriber::EnvFilter;

use args::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::load_default(),
    };

    match args.command {
        Command::Run { mock } => runner::run_engine(config, mock).await,
        Command::Worker { kind, mock } => runner::run_worker(config, &kind, mock).await,
        Command::CheckConfig => runner::check_config(&config),
    }
}
