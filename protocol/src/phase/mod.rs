//! Phase/substate model and transition validation.

pub mod transitions;
pub mod types;

pub use transitions::{
    available_transitions, failure_route, required_artifacts, transition_rule,
    validate_transition, Transition, TransitionError, TransitionKind, TransitionRule,
};
pub use types::{
    ArtifactSet, ArtifactTag, ProtocolPhase, ProtocolState, ProtocolSubstate, SubstateKind,
};
