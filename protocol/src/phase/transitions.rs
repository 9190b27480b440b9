//! Transition table and validator.
//!
//! The table encodes the only edges in the phase graph:
//! ```text
//! Ignition → Lattice → CompositionAudit → Injection → Mesoscopic → MassDefect → Complete
//!
//! CompositionAudit → Ignition   (contradictionReport)
//! Injection        → Lattice    (structuralDefectReport)
//! Mesoscopic       → Injection  (clusterFailureReport)
//! ```
//! Blocking and Failed substates are never produced here; the blocking
//! manager and the orchestrator's circuit-break handling own those.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{ArtifactSet, ArtifactTag, ProtocolPhase, ProtocolState, ProtocolSubstate};

/// Whether an edge moves forward or rewinds after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Forward,
    Failure,
}

/// One edge of the phase graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: ProtocolPhase,
    pub to: ProtocolPhase,
    pub kind: TransitionKind,
    pub required: &'static [ArtifactTag],
}

const TRANSITIONS: &[TransitionRule] = &[
    TransitionRule {
        from: ProtocolPhase::Ignition,
        to: ProtocolPhase::Lattice,
        kind: TransitionKind::Forward,
        required: &[ArtifactTag::Spec],
    },
    TransitionRule {
        from: ProtocolPhase::Lattice,
        to: ProtocolPhase::CompositionAudit,
        kind: TransitionKind::Forward,
        required: &[
            ArtifactTag::Spec,
            ArtifactTag::LatticeCode,
            ArtifactTag::Witnesses,
        ],
    },
    TransitionRule {
        from: ProtocolPhase::CompositionAudit,
        to: ProtocolPhase::Injection,
        kind: TransitionKind::Forward,
        required: &[ArtifactTag::LatticeCode, ArtifactTag::ValidatedStructure],
    },
    TransitionRule {
        from: ProtocolPhase::Injection,
        to: ProtocolPhase::Mesoscopic,
        kind: TransitionKind::Forward,
        required: &[ArtifactTag::ImplementedCode],
    },
    TransitionRule {
        from: ProtocolPhase::Mesoscopic,
        to: ProtocolPhase::MassDefect,
        kind: TransitionKind::Forward,
        required: &[ArtifactTag::VerifiedCode],
    },
    TransitionRule {
        from: ProtocolPhase::MassDefect,
        to: ProtocolPhase::Complete,
        kind: TransitionKind::Forward,
        required: &[ArtifactTag::FinalArtifact],
    },
    TransitionRule {
        from: ProtocolPhase::CompositionAudit,
        to: ProtocolPhase::Ignition,
        kind: TransitionKind::Failure,
        required: &[ArtifactTag::ContradictionReport],
    },
    TransitionRule {
        from: ProtocolPhase::Injection,
        to: ProtocolPhase::Lattice,
        kind: TransitionKind::Failure,
        required: &[ArtifactTag::StructuralDefectReport],
    },
    TransitionRule {
        from: ProtocolPhase::Mesoscopic,
        to: ProtocolPhase::Injection,
        kind: TransitionKind::Failure,
        required: &[ArtifactTag::ClusterFailureReport],
    },
];

/// Look up the edge between two phases.
pub fn transition_rule(from: ProtocolPhase, to: ProtocolPhase) -> Option<&'static TransitionRule> {
    TRANSITIONS.iter().find(|r| r.from == from && r.to == to)
}

/// Artifacts required to enter `phase` along the forward chain.
pub fn required_artifacts(phase: ProtocolPhase) -> &'static [ArtifactTag] {
    TRANSITIONS
        .iter()
        .find(|r| r.to == phase && r.kind == TransitionKind::Forward)
        .map(|r| r.required)
        .unwrap_or(&[])
}

/// The failure edge leaving `phase`, if it has one.
pub fn failure_route(phase: ProtocolPhase) -> Option<&'static TransitionRule> {
    TRANSITIONS
        .iter()
        .find(|r| r.from == phase && r.kind == TransitionKind::Failure)
}

/// Errors from [`validate_transition`]. State is never modified on error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot transition to {target}: missing artifacts [{}]", join_tags(.missing))]
    MissingArtifacts {
        target: ProtocolPhase,
        missing: Vec<ArtifactTag>,
    },

    #[error("invalid transition {from} → {to}")]
    InvalidTransition {
        from: ProtocolPhase,
        to: ProtocolPhase,
    },

    #[error("phase {phase} is blocked on a pending query")]
    BlockedState { phase: ProtocolPhase },

    #[error("phase {phase} is in a failed state")]
    FailedState { phase: ProtocolPhase },

    #[error("protocol is already complete")]
    AlreadyComplete,
}

impl TransitionError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingArtifacts { .. } => "MISSING_ARTIFACTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::BlockedState { .. } => "BLOCKED_STATE",
            Self::FailedState { .. } => "FAILED_STATE",
            Self::AlreadyComplete => "ALREADY_COMPLETE",
        }
    }
}

fn join_tags(tags: &[ArtifactTag]) -> String {
    tags.iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A validated transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ProtocolPhase,
    pub kind: TransitionKind,
    pub state: ProtocolState,
}

/// Check whether `current` may move to `target` given `available` artifacts.
///
/// On success returns the new `target/Active` state. The caller persists.
pub fn validate_transition(
    current: &ProtocolState,
    target: ProtocolPhase,
    available: &ArtifactSet,
) -> Result<Transition, TransitionError> {
    if current.phase.is_terminal() {
        return Err(TransitionError::AlreadyComplete);
    }

    match current.substate {
        ProtocolSubstate::Active => {}
        ProtocolSubstate::Blocking { .. } => {
            return Err(TransitionError::BlockedState {
                phase: current.phase,
            })
        }
        ProtocolSubstate::Failed { .. } => {
            return Err(TransitionError::FailedState {
                phase: current.phase,
            })
        }
    }

    let rule = transition_rule(current.phase, target).ok_or(TransitionError::InvalidTransition {
        from: current.phase,
        to: target,
    })?;

    let missing = available.missing(rule.required);
    if !missing.is_empty() {
        return Err(TransitionError::MissingArtifacts { target, missing });
    }

    Ok(Transition {
        from: current.phase,
        kind: rule.kind,
        state: ProtocolState::active(target),
    })
}

/// Targets `state` could legally move to right now.
pub fn available_transitions(state: &ProtocolState, available: &ArtifactSet) -> Vec<ProtocolPhase> {
    TRANSITIONS
        .iter()
        .filter(|r| r.from == state.phase)
        .filter(|r| validate_transition(state, r.to, available).is_ok())
        .map(|r| r.to)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn all_artifacts() -> ArtifactSet {
        ArtifactTag::ALL.into_iter().collect()
    }

    #[test]
    fn test_ignition_to_lattice_with_spec() {
        let state = ProtocolState::initial();
        let t = validate_transition(
            &state,
            ProtocolPhase::Lattice,
            &ArtifactSet::from([ArtifactTag::Spec]),
        )
        .unwrap();
        assert_eq!(t.state, ProtocolState::active(ProtocolPhase::Lattice));
        assert_eq!(t.kind, TransitionKind::Forward);
        assert_eq!(t.from, ProtocolPhase::Ignition);
    }

    #[test]
    fn test_ignition_to_injection_is_invalid_regardless_of_artifacts() {
        let state = ProtocolState::initial();
        for artifacts in [ArtifactSet::new(), all_artifacts()] {
            let err =
                validate_transition(&state, ProtocolPhase::Injection, &artifacts).unwrap_err();
            assert_eq!(err.code(), "INVALID_TRANSITION");
        }
    }

    #[test]
    fn test_missing_artifacts_lists_tags() {
        let state = ProtocolState::active(ProtocolPhase::Lattice);
        let err = validate_transition(
            &state,
            ProtocolPhase::CompositionAudit,
            &ArtifactSet::from([ArtifactTag::Spec]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TransitionError::MissingArtifacts {
                target: ProtocolPhase::CompositionAudit,
                missing: vec![ArtifactTag::LatticeCode, ArtifactTag::Witnesses],
            }
        );
        assert!(err.to_string().contains("latticeCode, witnesses"));
    }

    #[test]
    fn test_blocked_and_failed_substates_reject() {
        let blocked = ProtocolState {
            phase: ProtocolPhase::Ignition,
            substate: ProtocolSubstate::Blocking {
                query: "q".into(),
                options: None,
                blocked_at: Utc::now(),
                timeout_ms: None,
                escalated: false,
            },
        };
        let err = validate_transition(&blocked, ProtocolPhase::Lattice, &all_artifacts())
            .unwrap_err();
        assert_eq!(err.code(), "BLOCKED_STATE");

        let failed = blocked.with_substate(ProtocolSubstate::failed("boom", None, false));
        let err =
            validate_transition(&failed, ProtocolPhase::Lattice, &all_artifacts()).unwrap_err();
        assert_eq!(err.code(), "FAILED_STATE");
    }

    #[test]
    fn test_complete_rejects_everything() {
        let state = ProtocolState::active(ProtocolPhase::Complete);
        for target in ProtocolPhase::ALL {
            let err = validate_transition(&state, target, &all_artifacts()).unwrap_err();
            assert_eq!(err, TransitionError::AlreadyComplete);
        }
    }

    #[test]
    fn test_failure_transitions_require_report() {
        let state = ProtocolState::active(ProtocolPhase::Injection);
        let err = validate_transition(&state, ProtocolPhase::Lattice, &ArtifactSet::new())
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_ARTIFACTS");

        let t = validate_transition(
            &state,
            ProtocolPhase::Lattice,
            &ArtifactSet::from([ArtifactTag::StructuralDefectReport]),
        )
        .unwrap();
        assert_eq!(t.kind, TransitionKind::Failure);
        assert_eq!(t.state.phase, ProtocolPhase::Lattice);
    }

    #[test]
    fn test_no_other_backward_edges() {
        let state = ProtocolState::active(ProtocolPhase::MassDefect);
        let err = validate_transition(&state, ProtocolPhase::Ignition, &all_artifacts())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    /// Success iff the required set is a subset of what is available, for
    /// every edge and every single-tag removal.
    #[test]
    fn test_artifact_gating_is_exact() {
        for rule in TRANSITIONS {
            let state = ProtocolState::active(rule.from);
            let exact: ArtifactSet = rule.required.iter().copied().collect();
            assert!(validate_transition(&state, rule.to, &exact).is_ok());

            for removed in rule.required {
                let mut partial = exact.clone();
                partial.remove(*removed);
                let err = validate_transition(&state, rule.to, &partial).unwrap_err();
                assert_eq!(
                    err,
                    TransitionError::MissingArtifacts {
                        target: rule.to,
                        missing: vec![*removed],
                    }
                );
            }
        }
    }

    #[test]
    fn test_required_artifacts_and_routes() {
        assert_eq!(required_artifacts(ProtocolPhase::Lattice), &[ArtifactTag::Spec]);
        assert!(required_artifacts(ProtocolPhase::Ignition).is_empty());
        assert_eq!(
            failure_route(ProtocolPhase::Mesoscopic).map(|r| r.to),
            Some(ProtocolPhase::Injection)
        );
        assert!(failure_route(ProtocolPhase::Lattice).is_none());
    }

    #[test]
    fn test_available_transitions() {
        let state = ProtocolState::active(ProtocolPhase::CompositionAudit);
        let targets = available_transitions(&state, &all_artifacts());
        assert_eq!(targets, vec![ProtocolPhase::Injection, ProtocolPhase::Ignition]);
    }
}
