//! Orchestrator: the tick loop driving a protocol run.
//!
//! One tick performs at most one unit of external work, applies the outcome
//! (artifacts, transitions, escalation decisions, halts) and persists before
//! returning. Cancellation is only observed between ticks.
//!
//! ```text
//! tick:
//!   Blocking ──► handle expired timeout ──► persist ──► stop(Blocked)
//!   Failed   ──► unrecoverable: stop(Failed) / recoverable: reset to Active
//!   Complete ──► stop(Complete)
//!   Active   ──► run next step at the unit's tier
//!                 ├─ ok   → artifacts, rewind on failure report, or advance
//!                 └─ err  → classify → record attempt → decide → apply
//!              ──► persist
//! ```

pub mod plan;
pub mod tick;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocking::{BlockingError, BlockingRecord};
use crate::checkpoint::{PersistenceError, StateSnapshot};
use crate::escalation::{FunctionAttempts, ModelTier};
use crate::ledger::LedgerError;
use crate::phase::{
    available_transitions, ArtifactSet, ProtocolPhase, ProtocolState, SubstateKind, TransitionError,
};
use crate::telemetry::TelemetrySnapshot;

pub use plan::{artifacts_from, build_prompt, find_step, next_step, phase_steps, PhaseStep, StepKind};
pub use tick::{Orchestrator, StartMode};

/// Options offered when a circuit break needs human review.
pub const RESOLVE_RETRY: &str = "retry";
pub const RESOLVE_REWIND: &str = "rewind";
pub const RESOLVE_ABORT: &str = "abort";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Blocking(#[from] BlockingError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("No pending blocking query in phase {phase}")]
    NothingToResolve { phase: ProtocolPhase },

    #[error("Protocol is blocking in phase {phase}; resolve the query first")]
    Blocked { phase: ProtocolPhase },
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transition(e) => e.code(),
            Self::Blocking(e) => e.code(),
            Self::Persistence(e) => e.code(),
            Self::Ledger(e) => e.code(),
            Self::NothingToResolve { .. } => "NOTHING_TO_RESOLVE",
            Self::Blocked { .. } => "BLOCKED_STATE",
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Blocked,
    Failed,
    Complete,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocked => write!(f, "blocked"),
            Self::Failed => write!(f, "failed"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TickAction {
    /// A step succeeded but its phase has more steps.
    StepCompleted { unit: String },
    /// Forward transition.
    Advanced { from: ProtocolPhase, to: ProtocolPhase },
    /// Failure transition.
    Rewound { from: ProtocolPhase, to: ProtocolPhase },
    /// Same tier again on the next tick.
    Retried { unit: String, tier: ModelTier, with_hint: bool },
    Escalated { unit: String, to_tier: ModelTier },
    /// A blocking query was raised.
    Blocked { query: String },
    /// The run moved to a Failed substate.
    Failed { error: String, recoverable: bool },
    /// A blocking query was answered.
    Resolved { selection: String },
    /// A failure was cleared and the current unit starts over.
    Recovered,
    /// An expired blocking query was re-raised.
    TimeoutEscalated { query: String },
    /// An expired blocking query was answered with a default.
    TimeoutDefaulted { selection: String },
    /// Nothing to do in the current state.
    Idle,
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickResult {
    pub should_continue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub phase: ProtocolPhase,
    pub substate: SubstateKind,
    pub action: TickAction,
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub cancelled: bool,
    pub last: Option<TickResult>,
}

impl RunSummary {
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.last.as_ref().and_then(|r| r.stop_reason)
    }
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: ProtocolState,
    pub artifacts: ArtifactSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_query: Option<BlockingRecord>,
    pub available_transitions: Vec<ProtocolPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_unit: Option<FunctionAttempts>,
    pub telemetry: TelemetrySnapshot,
}

impl StatusReport {
    /// Report for `snapshot` as it stands, without running anything.
    pub fn from_snapshot(snapshot: &StateSnapshot, telemetry: TelemetrySnapshot) -> Self {
        let step = next_step(snapshot.state.phase, &snapshot.artifacts);
        Self {
            state: snapshot.state.clone(),
            artifacts: snapshot.artifacts.clone(),
            next_step: step.map(|s| s.id),
            pending_query: snapshot.pending_blocking().cloned(),
            available_transitions: available_transitions(&snapshot.state, &snapshot.artifacts),
            current_unit: step.and_then(|s| snapshot.attempts.get(s.id).cloned()),
            telemetry,
        }
    }

    /// Command that moves a halted run forward, if any.
    pub fn suggested_command(&self) -> Option<String> {
        match self.state.substate.kind() {
            SubstateKind::Blocking => {
                let options = self
                    .pending_query
                    .as_ref()
                    .and_then(|r| r.options.as_ref())
                    .map(|o| format!("<{}>", o.join("|")))
                    .unwrap_or_else(|| "<answer>".to_string());
                Some(format!("criticality resolve {options}"))
            }
            SubstateKind::Failed => Some("criticality recover".to_string()),
            SubstateKind::Active if self.state.is_complete() => None,
            SubstateKind::Active => Some("criticality run".to_string()),
        }
    }
}
