//! Escalation Engine: deterministic retry/escalate/circuit-break decisions
//!
//! Consumes a classified failure plus the unit's attempt history and produces
//! an [`EscalationDecision`]. No I/O and no LLM calls happen here; the
//! orchestrator records the attempt first, then asks for a decision.

use serde::{Deserialize, Serialize};

use super::attempts::FunctionAttempts;
use super::failure::FailureClassification;
use super::tier::ModelTier;

/// What to do with the unit next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationAction {
    /// Regenerate at the same tier, optionally with a hint in the prompt.
    RetrySame {
        with_hint: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    /// Regenerate at a higher tier.
    Escalate { to_tier: ModelTier },
    /// Stop automatic retries for this unit.
    CircuitBreak {
        reason: String,
        requires_human_review: bool,
    },
}

/// Decision produced by the Escalation Engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDecision {
    pub action: EscalationAction,
    /// Tier the next attempt runs at, `None` after a circuit break.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_tier: Option<ModelTier>,
    pub reason: String,
}

impl EscalationDecision {
    pub fn is_circuit_break(&self) -> bool {
        matches!(self.action, EscalationAction::CircuitBreak { .. })
    }

    pub fn requires_human_review(&self) -> bool {
        matches!(
            self.action,
            EscalationAction::CircuitBreak {
                requires_human_review: true,
                ..
            }
        )
    }

    fn retry(tier: ModelTier, hint: Option<String>, reason: String) -> Self {
        Self {
            action: EscalationAction::RetrySame {
                with_hint: hint.is_some(),
                hint,
            },
            next_tier: Some(tier),
            reason,
        }
    }

    fn escalate(to_tier: ModelTier, reason: String) -> Self {
        Self {
            action: EscalationAction::Escalate { to_tier },
            next_tier: Some(to_tier),
            reason,
        }
    }

    fn circuit_break(reason: String, requires_human_review: bool) -> Self {
        Self {
            action: EscalationAction::CircuitBreak {
                reason: reason.clone(),
                requires_human_review,
            },
            next_tier: None,
            reason,
        }
    }
}

/// Configuration for the Escalation Engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Total attempts across all tiers before a forced circuit break.
    pub max_attempts: u32,
    /// Same-tier attempts for type errors before escalating.
    pub type_retry_limit: u32,
    /// Same-tier attempts for test failures before escalating.
    pub test_retry_limit: u32,
    /// Same-tier attempts for complexity violations before escalating.
    pub complexity_retry_limit: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            type_retry_limit: 2,
            test_retry_limit: 3,
            complexity_retry_limit: 3,
        }
    }
}

/// The Escalation Engine: pure decision table
#[derive(Debug, Clone, Default)]
pub struct EscalationEngine {
    config: EscalationConfig,
}

impl EscalationEngine {
    /// Create a new engine with default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom config
    pub fn with_config(config: EscalationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Decide what happens after `failure` at `current_tier`.
    ///
    /// `attempts` must already include the failed attempt. The max-attempts
    /// guard is checked before the per-kind table and wins once triggered.
    pub fn determine_escalation(
        &self,
        failure: &FailureClassification,
        attempts: &FunctionAttempts,
        current_tier: ModelTier,
    ) -> EscalationDecision {
        if attempts.total_attempts >= self.config.max_attempts {
            return EscalationDecision::circuit_break(
                format!(
                    "Exceeded max attempts ({}/{}) for {}",
                    attempts.total_attempts, self.config.max_attempts, attempts.unit_id
                ),
                true,
            );
        }

        let same_tier = attempts.attempts_at(current_tier);
        let decision = match failure {
            FailureClassification::Syntax {
                message,
                recoverable: true,
            } => {
                // `same_tier` includes this failure; the hint starts with the second one.
                let hint = (same_tier > 1).then(|| syntax_hint(message));
                EscalationDecision::retry(
                    current_tier,
                    hint,
                    format!("Recoverable syntax error at {current_tier}, regenerating"),
                )
            }
            FailureClassification::Syntax {
                recoverable: false, ..
            } => self.escalate_or_break(current_tier, failure, false),
            FailureClassification::Type { .. } => {
                self.retry_then_escalate(current_tier, same_tier, self.config.type_retry_limit, failure, false)
            }
            FailureClassification::Test { .. } => {
                self.retry_then_escalate(current_tier, same_tier, self.config.test_retry_limit, failure, true)
            }
            FailureClassification::Complexity { .. } => self.retry_then_escalate(
                current_tier,
                same_tier,
                self.config.complexity_retry_limit,
                failure,
                true,
            ),
            FailureClassification::Timeout { .. } => {
                self.escalate_or_break(current_tier, failure, false)
            }
            FailureClassification::Semantic { .. } => {
                self.escalate_or_break(current_tier, failure, true)
            }
            FailureClassification::Security { .. } => {
                if current_tier.is_top() {
                    EscalationDecision::circuit_break(
                        format!("Security failure at architect: {}", failure.describe()),
                        true,
                    )
                } else {
                    EscalationDecision::escalate(
                        ModelTier::Architect,
                        format!(
                            "Security failure at {current_tier}, escalating directly to architect: {}",
                            failure.describe()
                        ),
                    )
                }
            }
            FailureClassification::Coherence { .. } => EscalationDecision::circuit_break(
                format!("Coherence failure cannot be retried: {}", failure.describe()),
                true,
            ),
        };

        tracing::debug!(
            unit = %attempts.unit_id,
            tier = %current_tier,
            failure = %failure.kind(),
            same_tier,
            total = attempts.total_attempts,
            reason = %decision.reason,
            "Escalation decision"
        );

        decision
    }

    fn retry_then_escalate(
        &self,
        tier: ModelTier,
        same_tier: u32,
        limit: u32,
        failure: &FailureClassification,
        review_at_top: bool,
    ) -> EscalationDecision {
        if same_tier < limit {
            EscalationDecision::retry(
                tier,
                None,
                format!(
                    "{} failure at {tier} ({same_tier}/{limit} attempts), retrying",
                    failure.kind()
                ),
            )
        } else {
            self.escalate_or_break(tier, failure, review_at_top)
        }
    }

    fn escalate_or_break(
        &self,
        tier: ModelTier,
        failure: &FailureClassification,
        review_at_top: bool,
    ) -> EscalationDecision {
        match tier.next() {
            Some(next) => EscalationDecision::escalate(
                next,
                format!("Escalating {tier} → {next}: {}", failure.describe()),
            ),
            None => EscalationDecision::circuit_break(
                format!("Architect tier exhausted: {}", failure.describe()),
                review_at_top,
            ),
        }
    }
}

/// Hint appended to the prompt after a repeated parse failure.
pub fn syntax_hint(message: &str) -> String {
    format!(
        "The previous output failed to parse: {message}. \
         Emit only complete, syntactically valid code with balanced delimiters."
    )
}

/// Convenience wrapper over a default-configured engine.
pub fn determine_escalation(
    failure: &FailureClassification,
    attempts: &FunctionAttempts,
    current_tier: ModelTier,
) -> EscalationDecision {
    EscalationEngine::new().determine_escalation(failure, attempts, current_tier)
}
