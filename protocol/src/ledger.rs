//! Decision ledger: append-only record of protocol decisions.
//!
//! [`InMemoryLedger`] is an arena of immutable [`Decision`]s with by-id and
//! by-category indices. Superseding a decision appends its replacement and
//! links the two through the `superseded_by` index; nothing is ever removed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::phase::ProtocolPhase;

/// What a decision is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCategory {
    Architectural,
    Implementation,
    Testing,
    Blocking,
    Escalation,
}

/// Who (or what) made the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    HumanResolution,
    TimeoutDefault,
    Orchestrator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Binding for the rest of the run.
    Canonical,
    /// Taken without explicit confirmation; may be revisited.
    Provisional,
}

/// A decision not yet assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDecision {
    pub category: DecisionCategory,
    pub source: DecisionSource,
    pub phase: ProtocolPhase,
    pub confidence: Confidence,
    pub summary: String,
    pub rationale: Option<String>,
}

/// A recorded decision. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub category: DecisionCategory,
    pub source: DecisionSource,
    pub phase: ProtocolPhase,
    pub confidence: Confidence,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Decision not found: {id}")]
    NotFound { id: String },

    #[error("Decision {id} already superseded by {by}")]
    AlreadySuperseded { id: String, by: String },

    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "DECISION_NOT_FOUND",
            Self::AlreadySuperseded { .. } => "ALREADY_SUPERSEDED",
            Self::Io(_) => "LEDGER_IO",
            Self::Serialization(_) => "LEDGER_SERIALIZATION",
        }
    }
}

/// Append-only decision store.
#[cfg_attr(test, mockall::automock)]
pub trait DecisionLedger: Send {
    /// Record a decision and return its id.
    fn append(&mut self, decision: NewDecision) -> Result<String, LedgerError>;

    /// Record `replacement` as superseding `old_id`. Returns the new id.
    fn supersede(&mut self, old_id: &str, replacement: NewDecision) -> Result<String, LedgerError>;

    /// Write recorded decisions to durable storage, if the ledger has any.
    fn flush(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Arena-backed ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    decisions: Vec<Decision>,
    by_id: HashMap<String, usize>,
    by_category: BTreeMap<DecisionCategory, Vec<usize>>,
    superseded_by: HashMap<String, String>,
    /// File written by [`DecisionLedger::flush`].
    backing_path: Option<PathBuf>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger (and its indices) from previously recorded decisions.
    pub fn from_decisions(decisions: Vec<Decision>) -> Self {
        let mut ledger = Self::new();
        for decision in decisions {
            ledger.insert(decision);
        }
        ledger
    }

    /// Load from a JSON file; a missing file yields an empty ledger.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let decisions: Vec<Decision> = serde_json::from_str(&content)?;
        Ok(Self::from_decisions(decisions))
    }

    /// Load from `path` and keep it as the file [`DecisionLedger::flush`] writes.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let mut ledger = Self::load(&path)?;
        ledger.backing_path = Some(path);
        Ok(ledger)
    }

    pub fn backing_path(&self) -> Option<&Path> {
        self.backing_path.as_deref()
    }

    /// Write all decisions to `path` (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&self.decisions)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Decision> {
        self.by_id.get(id).map(|&idx| &self.decisions[idx])
    }

    pub fn all(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn by_category(&self, category: DecisionCategory) -> Vec<&Decision> {
        self.by_category
            .get(&category)
            .map(|idxs| idxs.iter().map(|&i| &self.decisions[i]).collect())
            .unwrap_or_default()
    }

    pub fn superseded_by(&self, id: &str) -> Option<&str> {
        self.superseded_by.get(id).map(String::as_str)
    }

    /// Decisions that have not been superseded.
    pub fn active(&self) -> Vec<&Decision> {
        self.decisions
            .iter()
            .filter(|d| !self.superseded_by.contains_key(&d.id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    fn next_id(&self) -> String {
        format!("dec-{:04}", self.decisions.len() + 1)
    }

    fn insert(&mut self, decision: Decision) {
        let idx = self.decisions.len();
        if let Some(old) = &decision.supersedes {
            self.superseded_by.insert(old.clone(), decision.id.clone());
        }
        self.by_id.insert(decision.id.clone(), idx);
        self.by_category.entry(decision.category).or_default().push(idx);
        self.decisions.push(decision);
    }

    fn build(&self, new: NewDecision, supersedes: Option<String>) -> Decision {
        Decision {
            id: self.next_id(),
            category: new.category,
            source: new.source,
            phase: new.phase,
            confidence: new.confidence,
            summary: new.summary,
            rationale: new.rationale,
            created_at: Utc::now(),
            supersedes,
        }
    }
}

impl DecisionLedger for InMemoryLedger {
    fn append(&mut self, decision: NewDecision) -> Result<String, LedgerError> {
        let decision = self.build(decision, None);
        let id = decision.id.clone();
        tracing::debug!(id = %id, category = ?decision.category, source = ?decision.source, "Decision appended");
        self.insert(decision);
        Ok(id)
    }

    fn supersede(&mut self, old_id: &str, replacement: NewDecision) -> Result<String, LedgerError> {
        if !self.by_id.contains_key(old_id) {
            return Err(LedgerError::NotFound {
                id: old_id.to_string(),
            });
        }
        if let Some(by) = self.superseded_by.get(old_id) {
            return Err(LedgerError::AlreadySuperseded {
                id: old_id.to_string(),
                by: by.clone(),
            });
        }
        let decision = self.build(replacement, Some(old_id.to_string()));
        let id = decision.id.clone();
        tracing::debug!(id = %id, supersedes = %old_id, "Decision superseded");
        self.insert(decision);
        Ok(id)
    }

    /// Saves to the backing file. An empty ledger never creates one.
    fn flush(&self) -> Result<(), LedgerError> {
        match &self.backing_path {
            Some(path) if !self.is_empty() => self.save(path),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(summary: &str, category: DecisionCategory) -> NewDecision {
        NewDecision {
            category,
            source: DecisionSource::HumanResolution,
            phase: ProtocolPhase::Lattice,
            confidence: Confidence::Canonical,
            summary: summary.to_string(),
            rationale: None,
        }
    }

    #[test]
    fn test_append_indexes_by_id_and_category() {
        let mut ledger = InMemoryLedger::new();
        let a = ledger.append(decision("use arena", DecisionCategory::Architectural)).unwrap();
        let b = ledger.append(decision("approve", DecisionCategory::Blocking)).unwrap();

        assert_ne!(a, b);
        assert_eq!(ledger.get(&a).unwrap().summary, "use arena");
        assert_eq!(ledger.by_category(DecisionCategory::Blocking).len(), 1);
        assert!(ledger.by_category(DecisionCategory::Testing).is_empty());
    }

    #[test]
    fn test_supersede_keeps_both_decisions() {
        let mut ledger = InMemoryLedger::new();
        let old = ledger.append(decision("v1", DecisionCategory::Architectural)).unwrap();
        let new = ledger
            .supersede(&old, decision("v2", DecisionCategory::Architectural))
            .unwrap();

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.superseded_by(&old), Some(new.as_str()));
        assert_eq!(ledger.get(&new).unwrap().supersedes.as_deref(), Some(old.as_str()));
        let active: Vec<_> = ledger.active().into_iter().map(|d| d.id.clone()).collect();
        assert_eq!(active, vec![new]);
    }

    #[test]
    fn test_supersede_errors() {
        let mut ledger = InMemoryLedger::new();
        let err = ledger
            .supersede("dec-9999", decision("x", DecisionCategory::Testing))
            .unwrap_err();
        assert_eq!(err.code(), "DECISION_NOT_FOUND");

        let old = ledger.append(decision("v1", DecisionCategory::Testing)).unwrap();
        ledger.supersede(&old, decision("v2", DecisionCategory::Testing)).unwrap();
        let err = ledger
            .supersede(&old, decision("v3", DecisionCategory::Testing))
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_SUPERSEDED");
    }

    #[test]
    fn test_save_and_load_rebuilds_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut ledger = InMemoryLedger::new();
        let old = ledger.append(decision("v1", DecisionCategory::Blocking)).unwrap();
        ledger.supersede(&old, decision("v2", DecisionCategory::Blocking)).unwrap();
        ledger.save(&path).unwrap();

        let restored = InMemoryLedger::load(&path).unwrap();
        assert_eq!(restored.all(), ledger.all());
        assert!(restored.superseded_by(&old).is_some());
        assert_eq!(restored.by_category(DecisionCategory::Blocking).len(), 2);
    }

    #[test]
    fn test_flush_writes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.json");

        let mut ledger = InMemoryLedger::open(&path).unwrap();
        ledger.flush().unwrap();
        assert!(!path.exists());

        ledger.append(decision("approve", DecisionCategory::Blocking)).unwrap();
        ledger.flush().unwrap();
        let reopened = InMemoryLedger::open(&path).unwrap();
        assert_eq!(reopened.all(), ledger.all());
        assert_eq!(reopened.backing_path(), Some(path.as_path()));

        // Without a backing file, flush is a no-op.
        let mut detached = InMemoryLedger::new();
        detached.append(decision("approve", DecisionCategory::Blocking)).unwrap();
        detached.flush().unwrap();
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = InMemoryLedger::load(&dir.path().join("absent.json")).unwrap();
        assert!(ledger.is_empty());
    }
}
