//! `criticality`: drive a protocol run from the command line.
//!
//! # Usage
//!
//! ```bash
//! criticality run                 # tick until complete, blocked or failed
//! criticality run --max-ticks 3
//! criticality status --json
//! criticality resolve retry --rationale "flaky model output"
//! criticality recover
//! criticality reset
//! ```
//!
//! Ctrl-C stops after the tick in flight; a second Ctrl-C exits immediately.

mod command_ops;
mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use criticality_protocol::ProtocolConfig;
use tracing::error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ./criticality.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tick until the run completes, halts or is interrupted
    Run {
        /// Stop after this many ticks
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Show the persisted state and the suggested next command
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Answer the pending blocking query
    Resolve {
        selection: String,
        #[arg(long)]
        rationale: Option<String>,
    },
    /// Clear a failed state
    Recover,
    /// Delete the checkpoint and start over
    Reset,
}

async fn dispatch(args: Args) -> anyhow::Result<commands::Outcome> {
    let config = ProtocolConfig::load(args.config.as_deref())?;
    match args.command {
        Command::Run { max_ticks } => commands::run(&config, max_ticks).await,
        Command::Status { json } => commands::status(&config, json),
        Command::Resolve {
            selection,
            rationale,
        } => commands::resolve(&config, &selection, rationale.as_deref()),
        Command::Recover => commands::recover(&config),
        Command::Reset => commands::reset(&config),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match dispatch(args).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            error!(error = %format!("{e:#}"), "criticality failed");
            ExitCode::FAILURE
        }
    }
}
