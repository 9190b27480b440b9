//! Subcommand implementations.

use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use criticality_protocol::checkpoint::CheckpointStore;
use criticality_protocol::ledger::InMemoryLedger;
use criticality_protocol::orchestrator::{StatusReport, TickAction};
use criticality_protocol::phase::{ProtocolSubstate, SubstateKind};
use criticality_protocol::telemetry::{JsonlTelemetrySink, TelemetryAccumulator};
use criticality_protocol::{Orchestrator, ProtocolConfig, StartMode};

use crate::command_ops::CommandOperations;

/// Exit code 130, as a shell reports SIGINT.
const INTERRUPTED_EXIT: i32 = 130;

/// How the process should exit after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Success or an expected stop (blocked, complete, nothing to do).
    Ok,
    /// The run is in a Failed substate.
    Failed,
}

impl Outcome {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Ok => ExitCode::SUCCESS,
            Self::Failed => ExitCode::FAILURE,
        }
    }

    fn for_report(report: &StatusReport) -> Self {
        match report.state.substate.kind() {
            SubstateKind::Failed => Self::Failed,
            SubstateKind::Active | SubstateKind::Blocking => Self::Ok,
        }
    }
}

type CliOrchestrator = Orchestrator<CommandOperations, InMemoryLedger>;

fn store(config: &ProtocolConfig) -> CheckpointStore {
    CheckpointStore::with_options(&config.checkpoint.path, config.checkpoint.integrity_options())
}

/// Build an orchestrator from the checkpoint and ledger on disk.
///
/// The ledger is flushed to its file with every checkpoint save.
fn open(config: &ProtocolConfig) -> Result<CliOrchestrator> {
    let ledger_path = config.checkpoint.ledger_path();
    let ledger = InMemoryLedger::open(&ledger_path)
        .with_context(|| format!("Failed to load decision ledger {}", ledger_path.display()))?;

    let ops = CommandOperations::new(config.commands.clone());
    let (mut orchestrator, mode) = Orchestrator::resume(ops, ledger, store(config), config);
    match mode {
        StartMode::Fresh => info!(path = %config.checkpoint.path.display(), "Starting a new run"),
        StartMode::Resumed { warnings } => {
            for warning in warnings {
                warn!("{warning}");
            }
        }
        StartMode::Recovered { error, quarantined } => {
            warn!(code = error.code(), "Checkpoint unusable ({error}); starting a new run");
            if let Some(path) = quarantined {
                warn!(path = %path.display(), "Previous checkpoint kept for inspection");
            }
        }
    }

    if let Some(path) = &config.checkpoint.telemetry_path {
        orchestrator = orchestrator.with_telemetry_sink(Box::new(JsonlTelemetrySink::new(path)));
    }
    Ok(orchestrator)
}

pub async fn run(config: &ProtocolConfig, max_ticks: Option<u64>) -> Result<Outcome> {
    let mut orchestrator = open(config)?;

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Interrupt received; stopping after the current tick");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Second interrupt; exiting now. The tick in flight is not saved");
                std::process::exit(INTERRUPTED_EXIT);
            }
        }
    });

    let result = orchestrator.run(&cancel, max_ticks).await;
    watcher.abort();
    let summary = result.context("Protocol run failed")?;

    info!(
        ticks = summary.ticks,
        cancelled = summary.cancelled,
        stop = ?summary.stop_reason(),
        "Run finished"
    );
    let report = orchestrator.status();
    print_report(&report);
    Ok(Outcome::for_report(&report))
}

/// Report the checkpoint as it is on disk. Never modifies or quarantines it.
pub fn status(config: &ProtocolConfig, json: bool) -> Result<Outcome> {
    let path = &config.checkpoint.path;
    let (snapshot, warnings) = match store(config).inspect() {
        Ok(inspected) => inspected,
        Err(e) if e.is_not_found() => {
            println!("No protocol state found at {}", path.display());
            return Ok(Outcome::Ok);
        }
        Err(e) => {
            let code = e.code();
            return Err(anyhow::Error::new(e).context(format!(
                "Checkpoint {} is unusable [{code}]; `criticality run` would start over and move it aside",
                path.display()
            )));
        }
    };
    for warning in &warnings {
        warn!("{warning}");
    }

    let report = StatusReport::from_snapshot(&snapshot, TelemetryAccumulator::new().snapshot());
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to encode status")?
        );
    } else {
        print_report(&report);
    }
    Ok(Outcome::for_report(&report))
}

pub fn resolve(config: &ProtocolConfig, selection: &str, rationale: Option<&str>) -> Result<Outcome> {
    let mut orchestrator = open(config)?;
    let action = orchestrator
        .resolve_blocking(selection, rationale)
        .with_context(|| format!("Failed to resolve with '{selection}'"))?;

    println!("{}", describe(&action));
    let report = orchestrator.status();
    print_report(&report);
    Ok(Outcome::for_report(&report))
}

pub fn recover(config: &ProtocolConfig) -> Result<Outcome> {
    let mut orchestrator = open(config)?;
    let action = orchestrator.recover().context("Failed to recover")?;

    println!("{}", describe(&action));
    let report = orchestrator.status();
    print_report(&report);
    Ok(Outcome::for_report(&report))
}

pub fn reset(config: &ProtocolConfig) -> Result<Outcome> {
    let mut orchestrator = open(config)?;
    orchestrator.reset().context("Failed to reset")?;
    println!(
        "Checkpoint {} removed; the next run starts at ignition",
        config.checkpoint.path.display()
    );
    Ok(Outcome::Ok)
}

fn describe(action: &TickAction) -> String {
    match action {
        TickAction::Resolved { selection } => format!("Resolved with '{selection}'"),
        TickAction::Recovered => "Recovered; the current unit starts over".to_string(),
        TickAction::Rewound { from, to } => format!("Rewound from {from} to {to}"),
        TickAction::Failed { error, .. } => format!("Failed: {error}"),
        TickAction::Idle => "Nothing to do".to_string(),
        other => format!("{other:?}"),
    }
}

fn print_report(report: &StatusReport) {
    println!("State: {}", report.state.status_line());

    let artifacts: Vec<&str> = report.artifacts.iter().map(|a| a.as_str()).collect();
    if !artifacts.is_empty() {
        println!("Artifacts: {}", artifacts.join(", "));
    }
    if let Some(step) = report.next_step {
        println!("Next step: {step}");
    }
    if let Some(unit) = &report.current_unit {
        println!("Attempts: {}", unit.summary());
    }

    match &report.state.substate {
        ProtocolSubstate::Blocking { query, .. } => {
            println!("Query: {query}");
            if let Some(options) = report.pending_query.as_ref().and_then(|r| r.options.as_ref()) {
                println!("Options: {}", options.join(", "));
            }
        }
        ProtocolSubstate::Failed { error, code, .. } => match code {
            Some(code) => println!("Error [{code}]: {error}"),
            None => println!("Error: {error}"),
        },
        ProtocolSubstate::Active => {}
    }

    let telemetry = &report.telemetry;
    if telemetry.total_model_calls() > 0 {
        println!(
            "Model calls: {} ({} tokens)",
            telemetry.total_model_calls(),
            telemetry.total_tokens()
        );
    }
    if let Some(command) = report.suggested_command() {
        println!("Suggested: {command}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use criticality_protocol::checkpoint::StateSnapshot;
    use criticality_protocol::phase::{ProtocolPhase, ProtocolState};

    fn config_in(dir: &tempfile::TempDir) -> ProtocolConfig {
        let mut config = ProtocolConfig::default();
        config.checkpoint.path = dir.path().join("state.json");
        config
    }

    #[test]
    fn test_status_without_state() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(status(&config_in(&dir), false).unwrap(), Outcome::Ok);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_status_leaves_corrupt_checkpoint_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        std::fs::write(&config.checkpoint.path, "{ not json").unwrap();

        let err = status(&config, true).unwrap_err();
        assert!(format!("{err:#}").contains("parse_error"), "{err:#}");
        assert_eq!(std::fs::read_to_string(&config.checkpoint.path).unwrap(), "{ not json");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_status_leaves_strict_stale_checkpoint_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.checkpoint.stale_after_secs = 60;
        config.checkpoint.allow_stale_state = false;
        store(&config)
            .save_at(&StateSnapshot::initial(), chrono_hours_ago(2))
            .unwrap();

        let err = status(&config, false).unwrap_err();
        assert!(format!("{err:#}").contains("validation_error"), "{err:#}");
        assert!(config.checkpoint.path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_status_reports_failed_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let snapshot = StateSnapshot {
            state: ProtocolState::active(ProtocolPhase::Injection).with_substate(ProtocolSubstate::failed(
                "Circuit break on injection:implement",
                Some("CIRCUIT_BREAK"),
                false,
            )),
            ..StateSnapshot::default()
        };
        store(&config).save(&snapshot).unwrap();

        assert_eq!(status(&config, false).unwrap(), Outcome::Failed);
        assert_eq!(store(&config).load().unwrap(), snapshot);
    }

    fn chrono_hours_ago(hours: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now() - chrono::Duration::hours(hours)
    }
}
