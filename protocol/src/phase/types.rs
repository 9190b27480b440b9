//! Protocol phases, substates and the artifact vocabulary that gates them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered protocol phases. Declaration order is forward progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolPhase {
    /// Specification synthesis.
    Ignition,
    /// Type-level skeleton, contracts and witnesses.
    Lattice,
    /// Architect review of how the lattice composes.
    CompositionAudit,
    /// Function bodies are generated into the lattice.
    Injection,
    /// Cluster-level verification.
    Mesoscopic,
    /// Final optimization and verification pass.
    MassDefect,
    /// Terminal phase.
    Complete,
}

impl ProtocolPhase {
    /// All phases in forward order.
    pub const ALL: [ProtocolPhase; 7] = [
        Self::Ignition,
        Self::Lattice,
        Self::CompositionAudit,
        Self::Injection,
        Self::Mesoscopic,
        Self::MassDefect,
        Self::Complete,
    ];

    /// Whether this is the terminal phase.
    pub fn is_terminal(self) -> bool {
        self == Self::Complete
    }

    /// The next phase in the forward chain, `None` for `Complete`.
    pub fn next(self) -> Option<ProtocolPhase> {
        match self {
            Self::Ignition => Some(Self::Lattice),
            Self::Lattice => Some(Self::CompositionAudit),
            Self::CompositionAudit => Some(Self::Injection),
            Self::Injection => Some(Self::Mesoscopic),
            Self::Mesoscopic => Some(Self::MassDefect),
            Self::MassDefect => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    /// Snake-case identifier, identical to the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignition => "ignition",
            Self::Lattice => "lattice",
            Self::CompositionAudit => "composition_audit",
            Self::Injection => "injection",
            Self::Mesoscopic => "mesoscopic",
            Self::MassDefect => "mass_defect",
            Self::Complete => "complete",
        }
    }

    /// Parse the snake-case identifier.
    pub fn parse(value: &str) -> Option<ProtocolPhase> {
        Self::ALL.into_iter().find(|p| p.as_str() == value)
    }
}

impl std::fmt::Display for ProtocolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produced artifacts that gate phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactTag {
    Spec,
    LatticeCode,
    Contracts,
    Witnesses,
    ValidatedStructure,
    ImplementedCode,
    VerifiedCode,
    OptimizedCode,
    FinalArtifact,
    /// Composition audit found contradictory requirements.
    ContradictionReport,
    /// Injection hit a defect in the lattice itself.
    StructuralDefectReport,
    /// Mesoscopic verification failed for a cluster.
    ClusterFailureReport,
}

impl ArtifactTag {
    pub const ALL: [ArtifactTag; 12] = [
        Self::Spec,
        Self::LatticeCode,
        Self::Contracts,
        Self::Witnesses,
        Self::ValidatedStructure,
        Self::ImplementedCode,
        Self::VerifiedCode,
        Self::OptimizedCode,
        Self::FinalArtifact,
        Self::ContradictionReport,
        Self::StructuralDefectReport,
        Self::ClusterFailureReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::LatticeCode => "latticeCode",
            Self::Contracts => "contracts",
            Self::Witnesses => "witnesses",
            Self::ValidatedStructure => "validatedStructure",
            Self::ImplementedCode => "implementedCode",
            Self::VerifiedCode => "verifiedCode",
            Self::OptimizedCode => "optimizedCode",
            Self::FinalArtifact => "finalArtifact",
            Self::ContradictionReport => "contradictionReport",
            Self::StructuralDefectReport => "structuralDefectReport",
            Self::ClusterFailureReport => "clusterFailureReport",
        }
    }

    pub fn parse(value: &str) -> Option<ArtifactTag> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Report artifacts only exist to trigger a failure transition.
    pub fn is_report(self) -> bool {
        matches!(
            self,
            Self::ContradictionReport | Self::StructuralDefectReport | Self::ClusterFailureReport
        )
    }
}

impl std::fmt::Display for ArtifactTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of artifacts produced so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactSet(BTreeSet<ArtifactTag>);

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: ArtifactTag) -> bool {
        self.0.insert(tag)
    }

    pub fn remove(&mut self, tag: ArtifactTag) -> bool {
        self.0.remove(&tag)
    }

    pub fn contains(&self, tag: ArtifactTag) -> bool {
        self.0.contains(&tag)
    }

    pub fn contains_all(&self, tags: &[ArtifactTag]) -> bool {
        tags.iter().all(|t| self.0.contains(t))
    }

    /// Tags from `required` that are not in the set, in the order given.
    pub fn missing(&self, required: &[ArtifactTag]) -> Vec<ArtifactTag> {
        required
            .iter()
            .copied()
            .filter(|t| !self.0.contains(t))
            .collect()
    }

    pub fn extend(&mut self, tags: impl IntoIterator<Item = ArtifactTag>) {
        self.0.extend(tags);
    }

    pub fn iter(&self) -> impl Iterator<Item = ArtifactTag> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ArtifactTag> for ArtifactSet {
    fn from_iter<I: IntoIterator<Item = ArtifactTag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[ArtifactTag; N]> for ArtifactSet {
    fn from(tags: [ArtifactTag; N]) -> Self {
        tags.into_iter().collect()
    }
}

/// Operational mode within the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolSubstate {
    /// Work may proceed.
    Active,
    /// Halted pending a human decision.
    Blocking {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
        blocked_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        /// Set when an expired query was re-raised instead of answered.
        #[serde(default)]
        escalated: bool,
    },
    /// Halted pending recovery.
    Failed {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        failed_at: DateTime<Utc>,
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<BTreeMap<String, String>>,
    },
}

impl ProtocolSubstate {
    pub fn kind(&self) -> SubstateKind {
        match self {
            Self::Active => SubstateKind::Active,
            Self::Blocking { .. } => SubstateKind::Blocking,
            Self::Failed { .. } => SubstateKind::Failed,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Build a `Failed` substate stamped with the current time.
    pub fn failed(error: impl Into<String>, code: Option<&str>, recoverable: bool) -> Self {
        Self::Failed {
            error: error.into(),
            code: code.map(str::to_string),
            failed_at: Utc::now(),
            recoverable,
            context: None,
        }
    }
}

/// Discriminant of [`ProtocolSubstate`], used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstateKind {
    Active,
    Blocking,
    Failed,
}

impl std::fmt::Display for SubstateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Blocking => write!(f, "blocking"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Phase plus substate: the sole source of truth for what happens next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    pub phase: ProtocolPhase,
    pub substate: ProtocolSubstate,
}

impl ProtocolState {
    /// Fresh protocol: `Ignition/Active`.
    pub fn initial() -> Self {
        Self::active(ProtocolPhase::Ignition)
    }

    pub fn active(phase: ProtocolPhase) -> Self {
        Self {
            phase,
            substate: ProtocolSubstate::Active,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn with_substate(&self, substate: ProtocolSubstate) -> Self {
        Self {
            phase: self.phase,
            substate,
        }
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!("{}/{}", self.phase, self.substate.kind())
    }
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::initial()
    }
}
