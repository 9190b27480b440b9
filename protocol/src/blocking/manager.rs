//! Blocking Manager: enter, resolve and time out human-intervention halts.
//!
//! Blocking only ever changes the substate: the phase is the same before and
//! after. Every resolution is written to the decision ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::record::BlockingRecord;
use crate::ledger::{Confidence, DecisionCategory, DecisionLedger, DecisionSource, LedgerError, NewDecision};
use crate::phase::{ProtocolPhase, ProtocolState, ProtocolSubstate};

/// Failure code stamped on the substate by the `fail` timeout strategy.
pub const BLOCKING_TIMEOUT_CODE: &str = "BLOCKING_TIMEOUT";
/// Resolution recorded on a query closed by the `fail` timeout strategy.
pub const TIMEOUT_FAIL_RESOLUTION: &str = "timeout:fail";

#[derive(Debug, Error)]
pub enum BlockingError {
    #[error("Already blocking on query: {query}")]
    AlreadyBlocking { query: String },

    #[error("Cannot block in phase {phase}")]
    InvalidPhase { phase: ProtocolPhase },

    #[error("Cannot block while phase {phase} is failed; recover first")]
    FailedState { phase: ProtocolPhase },

    #[error("Not blocking (phase {phase})")]
    NotBlocking { phase: ProtocolPhase },

    #[error("Record {record_id} does not match the live blocking query")]
    QueryMismatch { record_id: String },

    #[error("Blocking query {record_id} is already resolved")]
    AlreadyResolved { record_id: String },

    #[error("Invalid selection '{selection}'; expected one of: {}", .options.join(", "))]
    InvalidOption {
        selection: String,
        options: Vec<String>,
    },

    #[error("Blocking query {record_id} has not timed out")]
    NotExpired { record_id: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl BlockingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyBlocking { .. } => "ALREADY_BLOCKING",
            Self::InvalidPhase { .. } => "INVALID_PHASE",
            Self::FailedState { .. } => "FAILED_STATE",
            Self::NotBlocking { .. } => "NOT_BLOCKING",
            Self::QueryMismatch { .. } => "QUERY_MISMATCH",
            Self::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            Self::InvalidOption { .. } => "INVALID_OPTION",
            Self::NotExpired { .. } => "NOT_EXPIRED",
            Self::Ledger(e) => e.code(),
        }
    }
}

/// What to do when a blocking query outlives its timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    /// Re-raise the query flagged as escalated.
    #[default]
    Escalate,
    /// Resolve with the configured default (or the first option).
    Default,
    /// Move to an unrecoverable Failed substate.
    Fail,
}

impl std::str::FromStr for TimeoutStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "escalate" => Ok(Self::Escalate),
            "default" => Ok(Self::Default),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown timeout strategy: {other}")),
        }
    }
}

/// Blocking configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockingConfig {
    /// Timeout applied when a query is raised without one.
    pub default_timeout_ms: Option<u64>,
    pub timeout_strategy: TimeoutStrategy,
    /// Answer used by the `default` strategy.
    pub default_option: Option<String>,
}

/// Elapsed/remaining time of a query with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutStatus {
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
    pub expired: bool,
}

/// How an expired query was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    Escalated,
    DefaultApplied { selection: String, decision_id: String },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutOutcome {
    pub state: ProtocolState,
    pub record: BlockingRecord,
    pub action: TimeoutAction,
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: ProtocolState,
    pub record: BlockingRecord,
    pub decision_id: String,
}

/// Elapsed/remaining time for `record`, `None` when it has no timeout.
pub fn check_timeout(record: &BlockingRecord, now: DateTime<Utc>) -> Option<TimeoutStatus> {
    let timeout_ms = record.timeout_ms?;
    let elapsed_ms = (now - record.blocked_at).num_milliseconds().max(0) as u64;
    Some(TimeoutStatus {
        elapsed_ms,
        remaining_ms: timeout_ms.saturating_sub(elapsed_ms),
        expired: elapsed_ms >= timeout_ms,
    })
}

#[derive(Debug, Clone, Default)]
pub struct BlockingManager {
    config: BlockingConfig,
}

impl BlockingManager {
    pub fn new(config: BlockingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BlockingConfig {
        &self.config
    }

    /// Halt `state` on `query`.
    pub fn enter_blocking(
        &self,
        state: &ProtocolState,
        query: &str,
        options: Option<Vec<String>>,
        timeout_ms: Option<u64>,
    ) -> Result<(ProtocolState, BlockingRecord), BlockingError> {
        self.enter_blocking_at(state, query, options, timeout_ms, Utc::now())
    }

    pub fn enter_blocking_at(
        &self,
        state: &ProtocolState,
        query: &str,
        options: Option<Vec<String>>,
        timeout_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<(ProtocolState, BlockingRecord), BlockingError> {
        if state.phase.is_terminal() {
            return Err(BlockingError::InvalidPhase { phase: state.phase });
        }
        match &state.substate {
            ProtocolSubstate::Active => {}
            ProtocolSubstate::Blocking { query, .. } => {
                return Err(BlockingError::AlreadyBlocking {
                    query: query.clone(),
                })
            }
            ProtocolSubstate::Failed { .. } => {
                return Err(BlockingError::FailedState { phase: state.phase })
            }
        }

        let timeout_ms = timeout_ms.or(self.config.default_timeout_ms);
        let record = BlockingRecord::new(state.phase, query, now)
            .with_options(options.clone())
            .with_timeout(timeout_ms);

        let next = state.with_substate(ProtocolSubstate::Blocking {
            query: query.to_string(),
            options,
            blocked_at: now,
            timeout_ms,
            escalated: false,
        });

        info!(phase = %state.phase, id = %record.id, query = %record.query, "Entered blocking");
        Ok((next, record))
    }

    /// Answer the live query with `selection`; Blocking → Active, same phase.
    pub fn resolve_blocking(
        &self,
        state: &ProtocolState,
        record: &BlockingRecord,
        selection: &str,
        rationale: Option<&str>,
        ledger: &mut dyn DecisionLedger,
    ) -> Result<Resolution, BlockingError> {
        self.resolve_with(
            state,
            record,
            selection,
            rationale,
            DecisionSource::HumanResolution,
            Confidence::Canonical,
            Utc::now(),
            ledger,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_with(
        &self,
        state: &ProtocolState,
        record: &BlockingRecord,
        selection: &str,
        rationale: Option<&str>,
        source: DecisionSource,
        confidence: Confidence,
        now: DateTime<Utc>,
        ledger: &mut dyn DecisionLedger,
    ) -> Result<Resolution, BlockingError> {
        ensure_matches(state, record)?;
        if !record.accepts(selection) {
            return Err(BlockingError::InvalidOption {
                selection: selection.to_string(),
                options: record.options.clone().unwrap_or_default(),
            });
        }

        let decision_id = ledger.append(NewDecision {
            category: DecisionCategory::Blocking,
            source,
            phase: state.phase,
            confidence,
            summary: format!("{} → {}", record.query, selection),
            rationale: rationale.map(str::to_string),
        })?;

        let mut resolved = record.clone();
        resolved.resolve(selection, now);

        info!(
            phase = %state.phase,
            id = %record.id,
            selection,
            decision = %decision_id,
            "Resolved blocking query"
        );

        Ok(Resolution {
            state: ProtocolState::active(state.phase),
            record: resolved,
            decision_id,
        })
    }

    /// Apply the configured strategy to an expired query.
    pub fn handle_timeout(
        &self,
        state: &ProtocolState,
        record: &BlockingRecord,
        now: DateTime<Utc>,
        ledger: &mut dyn DecisionLedger,
    ) -> Result<TimeoutOutcome, BlockingError> {
        ensure_matches(state, record)?;
        match check_timeout(record, now) {
            Some(status) if status.expired => {}
            _ => {
                return Err(BlockingError::NotExpired {
                    record_id: record.id.clone(),
                })
            }
        }

        match self.config.timeout_strategy {
            TimeoutStrategy::Escalate => Ok(escalate(state, record, now)),
            TimeoutStrategy::Default => match self.default_selection(record) {
                Some(selection) => {
                    let resolution = self.resolve_with(
                        state,
                        record,
                        &selection,
                        Some("Blocking query timed out; default applied"),
                        DecisionSource::TimeoutDefault,
                        Confidence::Provisional,
                        now,
                        ledger,
                    )?;
                    Ok(TimeoutOutcome {
                        state: resolution.state,
                        record: resolution.record,
                        action: TimeoutAction::DefaultApplied {
                            selection,
                            decision_id: resolution.decision_id,
                        },
                    })
                }
                None => {
                    warn!(id = %record.id, "No usable default option; escalating instead");
                    Ok(escalate(state, record, now))
                }
            },
            TimeoutStrategy::Fail => {
                let mut context = BTreeMap::new();
                context.insert("blocking_id".to_string(), record.id.clone());
                context.insert("query".to_string(), record.query.clone());
                let next = state.with_substate(ProtocolSubstate::Failed {
                    error: format!("Blocking query timed out: {}", record.query),
                    code: Some(BLOCKING_TIMEOUT_CODE.to_string()),
                    failed_at: now,
                    recoverable: false,
                    context: Some(context),
                });
                let decision_id = ledger.append(NewDecision {
                    category: DecisionCategory::Blocking,
                    source: DecisionSource::TimeoutDefault,
                    phase: state.phase,
                    confidence: Confidence::Provisional,
                    summary: format!("{} → {}", record.query, TIMEOUT_FAIL_RESOLUTION),
                    rationale: Some("Blocking query timed out; run failed".to_string()),
                })?;
                let mut closed = record.clone();
                closed.resolve(TIMEOUT_FAIL_RESOLUTION, now);

                warn!(
                    phase = %state.phase,
                    id = %record.id,
                    decision = %decision_id,
                    "Blocking query timed out; failing"
                );
                Ok(TimeoutOutcome {
                    state: next,
                    record: closed,
                    action: TimeoutAction::Failed,
                })
            }
        }
    }

    fn default_selection(&self, record: &BlockingRecord) -> Option<String> {
        let options = record.options.as_deref().unwrap_or_default();
        match &self.config.default_option {
            Some(default) if options.is_empty() || options.contains(default) => Some(default.clone()),
            _ => options.first().cloned(),
        }
    }
}

fn escalate(state: &ProtocolState, record: &BlockingRecord, now: DateTime<Utc>) -> TimeoutOutcome {
    let mut record = record.clone();
    record.escalated = true;
    record.blocked_at = now;

    warn!(phase = %state.phase, id = %record.id, "Blocking query timed out; escalating");
    TimeoutOutcome {
        state: state.with_substate(ProtocolSubstate::Blocking {
            query: record.query.clone(),
            options: record.options.clone(),
            blocked_at: now,
            timeout_ms: record.timeout_ms,
            escalated: true,
        }),
        record,
        action: TimeoutAction::Escalated,
    }
}

/// The record must be the unresolved query the state is blocked on.
fn ensure_matches(state: &ProtocolState, record: &BlockingRecord) -> Result<(), BlockingError> {
    let ProtocolSubstate::Blocking { query, .. } = &state.substate else {
        return Err(BlockingError::NotBlocking { phase: state.phase });
    };
    if record.resolved {
        return Err(BlockingError::AlreadyResolved {
            record_id: record.id.clone(),
        });
    }
    if &record.query != query || record.phase != state.phase {
        return Err(BlockingError::QueryMismatch {
            record_id: record.id.clone(),
        });
    }
    Ok(())
}
