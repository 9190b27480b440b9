//! Subprocess-backed external operations.
//!
//! Every operation is a configured shell-style command line, split with
//! `shlex` and run directly (no shell). Conventions:
//! - model call: prompt on stdin, tier in `CRITICALITY_TIER` and in place of
//!   any `{tier}` placeholder, reply on stdout
//! - archive: phase in `CRITICALITY_PHASE`
//! - notify: blocking record as JSON on stdin
//!
//! Any stdout line of the form `artifact: <tag>` declares an extra artifact,
//! which is how a command reports e.g. `contradictionReport`.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use criticality_protocol::blocking::BlockingRecord;
use criticality_protocol::config::CommandsConfig;
use criticality_protocol::escalation::ModelTier;
use criticality_protocol::operations::{
    ExternalOperations, FailureStage, ModelResponse, OperationFailure, OperationOutput,
};
use criticality_protocol::phase::{ArtifactTag, ProtocolPhase};
use criticality_protocol::telemetry::ModelCallMetrics;

const ARTIFACT_PREFIX: &str = "artifact:";
const TIER_PLACEHOLDER: &str = "{tier}";

pub struct CommandOperations {
    commands: CommandsConfig,
}

impl CommandOperations {
    pub fn new(commands: CommandsConfig) -> Self {
        Self { commands }
    }

    /// Run `command_line`, returning stdout on success.
    ///
    /// Spawn and I/O problems are transient; a non-zero exit or a timeout is
    /// a real failure carrying the command's output. Timeouts set `timed_out`.
    async fn execute(
        &self,
        stage: FailureStage,
        command_line: &str,
        input: Option<Vec<u8>>,
        envs: &[(&str, &str)],
    ) -> Result<String, OperationFailure> {
        let argv = split_command(stage, command_line)?;
        self.execute_argv(stage, argv, input, envs).await
    }

    async fn execute_argv(
        &self,
        stage: FailureStage,
        argv: Vec<String>,
        input: Option<Vec<u8>>,
        envs: &[(&str, &str)],
    ) -> Result<String, OperationFailure> {
        let program = &argv[0];

        let mut command = tokio::process::Command::new(program);
        command
            .args(&argv[1..])
            .envs(envs.iter().copied())
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| OperationFailure::transient(stage, format!("Failed to start {program}: {e}")))?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            // Written concurrently so a chatty child cannot deadlock on a full pipe.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("stdin closed early: {e}");
                }
            });
        }

        let timeout_secs = self.commands.timeout_secs;
        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(OperationFailure::transient(
                    stage,
                    format!("Failed to wait for {program}: {e}"),
                ))
            }
            Err(_) => {
                return Err(OperationFailure::timed_out(
                    stage,
                    format!("{program} timed out after {timeout_secs}s"),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);
        debug!(%program, code, stage = %stage, "Command failed");
        Err(OperationFailure::new(
            stage,
            format!("{}\n{}", stderr.trim_end(), stdout.trim_end())
                .trim()
                .to_string(),
        ))
    }
}

fn split_command(stage: FailureStage, command_line: &str) -> Result<Vec<String>, OperationFailure> {
    shlex::split(command_line)
        .filter(|argv| !argv.is_empty())
        .ok_or_else(|| OperationFailure::transient(stage, format!("Cannot parse command line: {command_line}")))
}

/// Replace `{tier}` in every argument with the tier name.
pub fn with_tier(argv: Vec<String>, tier: ModelTier) -> Vec<String> {
    argv.into_iter()
        .map(|arg| arg.replace(TIER_PLACEHOLDER, tier.as_str()))
        .collect()
}

/// Tags declared with `artifact: <tag>` lines. Unknown tags are ignored.
pub fn declared_artifacts(output: &str) -> Vec<ArtifactTag> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(ARTIFACT_PREFIX))
        .filter_map(|tag| {
            let tag = tag.trim();
            let parsed = ArtifactTag::parse(tag);
            if parsed.is_none() {
                warn!(%tag, "Ignoring unknown artifact tag");
            }
            parsed
        })
        .collect()
}

#[async_trait]
impl ExternalOperations for CommandOperations {
    async fn execute_model_call(
        &self,
        tier: ModelTier,
        prompt: &str,
    ) -> Result<ModelResponse, OperationFailure> {
        let started = Instant::now();
        let argv = with_tier(split_command(FailureStage::ModelCall, &self.commands.model)?, tier);
        let program = argv.first().cloned();
        let content = self
            .execute_argv(
                FailureStage::ModelCall,
                argv,
                Some(prompt.as_bytes().to_vec()),
                &[("CRITICALITY_TIER", tier.as_str())],
            )
            .await?;

        Ok(ModelResponse {
            artifacts: declared_artifacts(&content),
            metrics: ModelCallMetrics {
                tier,
                model: program,
                duration_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            },
            content,
        })
    }

    async fn run_compilation(&self) -> Result<OperationOutput, OperationFailure> {
        let output = self
            .execute(FailureStage::Compilation, &self.commands.compile, None, &[])
            .await?;
        Ok(OperationOutput {
            artifacts: declared_artifacts(&output),
            output,
        })
    }

    async fn run_tests(&self) -> Result<OperationOutput, OperationFailure> {
        let output = self
            .execute(FailureStage::Tests, &self.commands.test, None, &[])
            .await?;
        Ok(OperationOutput {
            artifacts: declared_artifacts(&output),
            output,
        })
    }

    async fn archive_phase_artifacts(&self, phase: ProtocolPhase) -> Result<(), OperationFailure> {
        let Some(archive) = &self.commands.archive else {
            return Ok(());
        };
        self.execute(
            FailureStage::Archive,
            archive,
            None,
            &[("CRITICALITY_PHASE", phase.as_str())],
        )
        .await?;
        info!(%phase, "Phase artifacts archived");
        Ok(())
    }

    async fn send_blocking_notification(&self, record: &BlockingRecord) {
        let Some(notify) = &self.commands.notify else {
            info!(id = %record.id, query = %record.query, "Blocking query raised");
            return;
        };
        let payload = match serde_json::to_vec(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %record.id, "Failed to encode blocking record: {e}");
                return;
            }
        };
        if let Err(e) = self
            .execute(FailureStage::ModelCall, notify, Some(payload), &[])
            .await
        {
            warn!(id = %record.id, "Blocking notification failed: {}", e.message);
        }
    }
}
