//! External collaborators driven by the orchestrator.
//!
//! The control core never calls a model, a compiler or a test runner itself.
//! Everything goes through [`ExternalOperations`], which the binary backs
//! with subprocesses and tests back with scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocking::BlockingRecord;
use crate::escalation::{FailureClassification, ModelTier};
use crate::phase::{ArtifactTag, ProtocolPhase};
use crate::telemetry::ModelCallMetrics;

/// Which external operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    ModelCall,
    Compilation,
    Tests,
    Archive,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelCall => "model_call",
            Self::Compilation => "compilation",
            Self::Tests => "tests",
            Self::Archive => "archive",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{stage} failed: {message}")]
pub struct OperationFailure {
    pub stage: FailureStage,
    pub message: String,
    /// Set when the collaborator already knows what went wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClassification>,
    /// Transport-level problem (spawn failure, network). Does not count as an attempt.
    #[serde(default)]
    pub transient: bool,
    /// The operation was cut off by the runner's time budget.
    #[serde(default)]
    pub timed_out: bool,
}

impl OperationFailure {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            classification: None,
            transient: false,
            timed_out: false,
        }
    }

    pub fn transient(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::new(stage, message)
        }
    }

    /// The runner stopped the operation at its time limit.
    pub fn timed_out(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(stage, message)
        }
    }

    pub fn with_classification(mut self, classification: FailureClassification) -> Self {
        self.classification = Some(classification);
        self
    }
}

/// Successful model call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    /// Extra artifacts the response produced, such as a contradiction report.
    #[serde(default)]
    pub artifacts: Vec<ArtifactTag>,
    #[serde(default)]
    pub metrics: ModelCallMetrics,
}

/// Successful compilation or test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutput {
    pub output: String,
    /// Extra artifacts the run produced, such as a cluster failure report.
    #[serde(default)]
    pub artifacts: Vec<ArtifactTag>,
}

/// Everything the tick loop needs from the outside world.
#[async_trait]
pub trait ExternalOperations: Send + Sync {
    async fn execute_model_call(
        &self,
        tier: ModelTier,
        prompt: &str,
    ) -> Result<ModelResponse, OperationFailure>;

    async fn run_compilation(&self) -> Result<OperationOutput, OperationFailure>;

    async fn run_tests(&self) -> Result<OperationOutput, OperationFailure>;

    async fn archive_phase_artifacts(&self, phase: ProtocolPhase) -> Result<(), OperationFailure>;

    /// Fire-and-forget; implementations log their own delivery problems.
    async fn send_blocking_notification(&self, record: &BlockingRecord);
}
