//! Per-unit attempt bookkeeping.
//!
//! Every operation here is a pure transform: the input is borrowed and a new
//! value is returned, so a decision can always be replayed from its inputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::engine::{EscalationAction, EscalationDecision};
use super::failure::FailureClassification;
use super::tier::ModelTier;

/// Attempt history for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionAttempts {
    pub unit_id: String,
    pub total_attempts: u32,
    #[serde(default)]
    pub attempts_by_tier: BTreeMap<ModelTier, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureClassification>,
    #[serde(default)]
    pub syntax_hint_provided: bool,
    /// Tier the unit is evaluated at. Only ever moves up the ladder.
    #[serde(default)]
    pub current_tier: ModelTier,
}

impl FunctionAttempts {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            total_attempts: 0,
            attempts_by_tier: BTreeMap::new(),
            last_failure: None,
            syntax_hint_provided: false,
            current_tier: ModelTier::Worker,
        }
    }

    /// Attempts made at `tier`.
    pub fn attempts_at(&self, tier: ModelTier) -> u32 {
        self.attempts_by_tier.get(&tier).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        format!(
            "unit={} tier={} total={} worker={} fallback={} architect={}",
            self.unit_id,
            self.current_tier,
            self.total_attempts,
            self.attempts_at(ModelTier::Worker),
            self.attempts_at(ModelTier::Fallback),
            self.attempts_at(ModelTier::Architect),
        )
    }
}

/// Count one attempt at `tier`, remembering `failure` as the latest one.
pub fn record_attempt(
    attempts: &FunctionAttempts,
    tier: ModelTier,
    failure: Option<&FailureClassification>,
) -> FunctionAttempts {
    let mut next = attempts.clone();
    next.total_attempts += 1;
    *next.attempts_by_tier.entry(tier).or_insert(0) += 1;
    next.last_failure = failure.cloned();
    next
}

/// Mark that the next regenerated prompt carries a syntax hint.
pub fn record_syntax_hint(attempts: &FunctionAttempts) -> FunctionAttempts {
    FunctionAttempts {
        syntax_hint_provided: true,
        ..attempts.clone()
    }
}

/// Clear the syntax hint flag (after a successful parse).
pub fn reset_syntax_hint(attempts: &FunctionAttempts) -> FunctionAttempts {
    FunctionAttempts {
        syntax_hint_provided: false,
        ..attempts.clone()
    }
}

/// Apply a decision's tier movement. The tier never decreases.
pub fn apply_decision(attempts: &FunctionAttempts, decision: &EscalationDecision) -> FunctionAttempts {
    let mut next = attempts.clone();
    match &decision.action {
        EscalationAction::Escalate { to_tier } => {
            next.current_tier = next.current_tier.max(*to_tier);
        }
        EscalationAction::RetrySame { with_hint, .. } => {
            next.syntax_hint_provided = *with_hint;
        }
        EscalationAction::CircuitBreak { .. } => {}
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_failure() -> FailureClassification {
        FailureClassification::Type {
            compiler_error: "E0308 mismatched types".into(),
        }
    }

    #[test]
    fn test_record_attempt_is_pure() {
        let original = FunctionAttempts::new("lattice:generate");
        let failure = type_failure();
        let next = record_attempt(&original, ModelTier::Worker, Some(&failure));

        assert_eq!(original.total_attempts, 0);
        assert!(original.last_failure.is_none());

        assert_eq!(next.total_attempts, 1);
        assert_eq!(next.attempts_at(ModelTier::Worker), 1);
        assert_eq!(next.attempts_at(ModelTier::Fallback), 0);
        assert_eq!(next.last_failure, Some(failure));
    }

    #[test]
    fn test_attempts_accumulate_per_tier() {
        let mut attempts = FunctionAttempts::new("u");
        attempts = record_attempt(&attempts, ModelTier::Worker, None);
        attempts = record_attempt(&attempts, ModelTier::Worker, None);
        attempts = record_attempt(&attempts, ModelTier::Architect, None);
        assert_eq!(attempts.total_attempts, 3);
        assert_eq!(attempts.attempts_at(ModelTier::Worker), 2);
        assert_eq!(attempts.attempts_at(ModelTier::Architect), 1);
    }

    #[test]
    fn test_syntax_hint_toggle() {
        let attempts = FunctionAttempts::new("u");
        let hinted = record_syntax_hint(&attempts);
        assert!(hinted.syntax_hint_provided);
        assert!(!attempts.syntax_hint_provided);
        assert!(!reset_syntax_hint(&hinted).syntax_hint_provided);
    }

    #[test]
    fn test_apply_decision_never_lowers_tier() {
        let mut attempts = FunctionAttempts::new("u");
        attempts.current_tier = ModelTier::Architect;
        let decision = EscalationDecision {
            action: EscalationAction::Escalate {
                to_tier: ModelTier::Fallback,
            },
            next_tier: Some(ModelTier::Fallback),
            reason: "test".into(),
        };
        let next = apply_decision(&attempts, &decision);
        assert_eq!(next.current_tier, ModelTier::Architect);
    }

    #[test]
    fn test_serde_roundtrip_with_tier_map() {
        let mut attempts = FunctionAttempts::new("u");
        attempts = record_attempt(&attempts, ModelTier::Fallback, Some(&type_failure()));
        let json = serde_json::to_string(&attempts).unwrap();
        assert!(json.contains("\"fallback\":1"), "JSON: {json}");
        let restored: FunctionAttempts = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, attempts);
    }
}
