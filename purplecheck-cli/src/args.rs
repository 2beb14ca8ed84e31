//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "purplecheck")]
#[command(author, version, about = "Purple-team checking engine")]
pub struct Args {
    /// Path to configuration file (defaults to the config cascade)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full engine: consumers, dispatcher, and worker pools
    Run {
        /// Register the mock detector for every platform (demo/dev runs)
        #[arg(long)]
        mock: bool,
    },
    /// Run a standalone worker pool without the ingestion side
    Worker {
        /// Worker kind to run: api or agent
        #[arg(long, default_value = "api")]
        kind: String,
        /// Register the mock detector for every platform
        #[arg(long)]
        mock: bool,
    },
    /// Validate configuration and print the effective settings
    CheckConfig,
}
