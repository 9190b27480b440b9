//! Fixed per-phase work plan.
//!
//! Each phase is a list of steps; a step is one unit of generated work with a
//! stable id used to key its attempt history. The next step is the first one
//! whose outputs are not all available yet.

use crate::escalation::{generate_failure_summary, syntax_hint, FailureClassification, FunctionAttempts};
use crate::phase::{ArtifactSet, ArtifactTag, ProtocolPhase};

/// Which external operations a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Model call only.
    Generate,
    /// Model call, then compilation.
    GenerateAndCompile,
    /// Test run only.
    Test,
}

impl StepKind {
    pub fn calls_model(self) -> bool {
        !matches!(self, Self::Test)
    }
}

/// One unit of work inside a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStep {
    /// Unit id, e.g. `lattice:witnesses`.
    pub id: &'static str,
    pub phase: ProtocolPhase,
    pub kind: StepKind,
    /// Instruction placed at the top of the prompt.
    pub purpose: &'static str,
    /// Contract the output must satisfy; carried into failure summaries.
    pub signature: &'static str,
    pub outputs: &'static [ArtifactTag],
}

const IGNITION: &[PhaseStep] = &[PhaseStep {
    id: "ignition:spec",
    phase: ProtocolPhase::Ignition,
    kind: StepKind::Generate,
    purpose: "Produce the system specification: modules, data model, invariants and acceptance criteria.",
    signature: "requirements -> spec",
    outputs: &[ArtifactTag::Spec],
}];

const LATTICE: &[PhaseStep] = &[
    PhaseStep {
        id: "lattice:structure",
        phase: ProtocolPhase::Lattice,
        kind: StepKind::GenerateAndCompile,
        purpose: "Generate the compilable code skeleton (types, signatures, contracts) for the specification, with todo bodies.",
        signature: "spec -> latticeCode + contracts",
        outputs: &[ArtifactTag::LatticeCode, ArtifactTag::Contracts],
    },
    PhaseStep {
        id: "lattice:witnesses",
        phase: ProtocolPhase::Lattice,
        kind: StepKind::GenerateAndCompile,
        purpose: "Generate type witnesses encoding the specification's invariants against the skeleton.",
        signature: "latticeCode + contracts -> witnesses",
        outputs: &[ArtifactTag::Witnesses],
    },
];

const COMPOSITION_AUDIT: &[PhaseStep] = &[PhaseStep {
    id: "composition_audit:audit",
    phase: ProtocolPhase::CompositionAudit,
    kind: StepKind::Generate,
    purpose: "Audit the skeleton and its contracts for contradictions; report any contradiction found.",
    signature: "spec + latticeCode + witnesses -> validatedStructure | contradictionReport",
    outputs: &[ArtifactTag::ValidatedStructure],
}];

const INJECTION: &[PhaseStep] = &[PhaseStep {
    id: "injection:implement",
    phase: ProtocolPhase::Injection,
    kind: StepKind::GenerateAndCompile,
    purpose: "Implement every todo body in the validated skeleton without changing signatures.",
    signature: "latticeCode + validatedStructure -> implementedCode",
    outputs: &[ArtifactTag::ImplementedCode],
}];

const MESOSCOPIC: &[PhaseStep] = &[PhaseStep {
    id: "mesoscopic:verify",
    phase: ProtocolPhase::Mesoscopic,
    kind: StepKind::Test,
    purpose: "Verify implemented modules cluster by cluster.",
    signature: "implementedCode -> verifiedCode | clusterFailureReport",
    outputs: &[ArtifactTag::VerifiedCode],
}];

const MASS_DEFECT: &[PhaseStep] = &[
    PhaseStep {
        id: "mass_defect:optimize",
        phase: ProtocolPhase::MassDefect,
        kind: StepKind::GenerateAndCompile,
        purpose: "Simplify and optimize the verified implementation while preserving behavior.",
        signature: "verifiedCode -> optimizedCode",
        outputs: &[ArtifactTag::OptimizedCode],
    },
    PhaseStep {
        id: "mass_defect:final",
        phase: ProtocolPhase::MassDefect,
        kind: StepKind::Test,
        purpose: "Run the full verification suite on the optimized code.",
        signature: "optimizedCode -> finalArtifact",
        outputs: &[ArtifactTag::FinalArtifact],
    },
];

/// Steps of `phase`, in execution order. Empty for `Complete`.
pub fn phase_steps(phase: ProtocolPhase) -> &'static [PhaseStep] {
    match phase {
        ProtocolPhase::Ignition => IGNITION,
        ProtocolPhase::Lattice => LATTICE,
        ProtocolPhase::CompositionAudit => COMPOSITION_AUDIT,
        ProtocolPhase::Injection => INJECTION,
        ProtocolPhase::Mesoscopic => MESOSCOPIC,
        ProtocolPhase::MassDefect => MASS_DEFECT,
        ProtocolPhase::Complete => &[],
    }
}

/// First step of `phase` whose outputs are not all in `artifacts`.
pub fn next_step(phase: ProtocolPhase, artifacts: &ArtifactSet) -> Option<&'static PhaseStep> {
    phase_steps(phase)
        .iter()
        .find(|step| !artifacts.contains_all(step.outputs))
}

/// Look a step up by unit id.
pub fn find_step(id: &str) -> Option<&'static PhaseStep> {
    ProtocolPhase::ALL
        .into_iter()
        .flat_map(phase_steps)
        .find(|step| step.id == id)
}

/// Artifacts produced by steps of `phase` and every later phase.
pub fn artifacts_from(phase: ProtocolPhase) -> Vec<ArtifactTag> {
    ProtocolPhase::ALL
        .into_iter()
        .filter(|p| *p >= phase)
        .flat_map(phase_steps)
        .flat_map(|step| step.outputs.iter().copied())
        .collect()
}

/// Prompt for the next attempt at `step`.
///
/// Only the step purpose, its signature and a summary of the latest failure
/// are included; earlier attempts never reach the prompt.
pub fn build_prompt(step: &PhaseStep, attempts: Option<&FunctionAttempts>) -> String {
    let mut prompt = format!("{}\n\nSignature: {}", step.purpose, step.signature);
    let Some(failure) = attempts.and_then(|a| a.last_failure.as_ref()) else {
        return prompt;
    };
    prompt.push_str("\n\n");
    prompt.push_str(&generate_failure_summary(step.id, step.signature, failure));
    if let FailureClassification::Syntax { message, .. } = failure {
        if attempts.is_some_and(|a| a.syntax_hint_provided) {
            prompt.push_str("\n\nHint: ");
            prompt.push_str(&syntax_hint(message));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::{record_attempt, record_syntax_hint, ModelTier};
    use crate::phase::required_artifacts;

    #[test]
    fn test_steps_produce_next_phase_requirements() {
        // Everything a phase needs to enter its successor is produced by
        // steps up to and including that phase.
        for phase in ProtocolPhase::ALL {
            let Some(next) = phase.next() else { continue };
            let produced: ArtifactSet = ProtocolPhase::ALL
                .into_iter()
                .filter(|p| *p <= phase)
                .flat_map(phase_steps)
                .flat_map(|s| s.outputs.iter().copied())
                .collect();
            assert!(
                produced.contains_all(required_artifacts(next)),
                "{phase} cannot reach {next}"
            );
        }
    }

    #[test]
    fn test_next_step_skips_completed_outputs() {
        let mut artifacts = ArtifactSet::from([ArtifactTag::Spec]);
        assert_eq!(next_step(ProtocolPhase::Lattice, &artifacts).unwrap().id, "lattice:structure");
        artifacts.extend([ArtifactTag::LatticeCode, ArtifactTag::Contracts]);
        assert_eq!(next_step(ProtocolPhase::Lattice, &artifacts).unwrap().id, "lattice:witnesses");
        artifacts.insert(ArtifactTag::Witnesses);
        assert!(next_step(ProtocolPhase::Lattice, &artifacts).is_none());
        assert!(next_step(ProtocolPhase::Complete, &artifacts).is_none());
    }

    #[test]
    fn test_artifacts_from_lattice() {
        let cleared = artifacts_from(ProtocolPhase::Lattice);
        assert!(!cleared.contains(&ArtifactTag::Spec));
        assert!(cleared.contains(&ArtifactTag::LatticeCode));
        assert!(cleared.contains(&ArtifactTag::FinalArtifact));
        assert!(artifacts_from(ProtocolPhase::Ignition).contains(&ArtifactTag::Spec));
    }

    #[test]
    fn test_step_ids_are_unique() {
        let ids: Vec<_> = ProtocolPhase::ALL
            .into_iter()
            .flat_map(phase_steps)
            .map(|s| s.id)
            .collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
        assert_eq!(find_step("injection:implement").unwrap().phase, ProtocolPhase::Injection);
    }

    #[test]
    fn test_prompt_carries_only_latest_failure() {
        let step = find_step("injection:implement").unwrap();
        assert!(!build_prompt(step, None).contains("Previous attempt"));

        let first = FailureClassification::Type {
            compiler_error: "E0308 first".into(),
        };
        let second = FailureClassification::Syntax {
            message: "expected `;`".into(),
            recoverable: true,
        };
        let mut attempts = FunctionAttempts::new(step.id);
        attempts = record_attempt(&attempts, ModelTier::Worker, Some(&first));
        attempts = record_attempt(&attempts, ModelTier::Worker, Some(&second));

        let prompt = build_prompt(step, Some(&attempts));
        assert!(prompt.starts_with(step.purpose));
        assert!(prompt.contains("expected `;`"));
        assert!(!prompt.contains("E0308 first"));
        assert!(!prompt.contains("Hint:"));

        let hinted = record_syntax_hint(&attempts);
        assert!(build_prompt(step, Some(&hinted)).contains("Hint: The previous output failed to parse"));
    }
}
