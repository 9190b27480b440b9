//! Persisted protocol snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blocking::BlockingRecord;
use crate::escalation::FunctionAttempts;
use crate::phase::{ArtifactSet, ProtocolState, ProtocolSubstate};

/// Current on-disk schema version (`major.minor.patch`).
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Everything needed to resume a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: ProtocolState,
    pub artifacts: ArtifactSet,
    /// Every blocking query ever raised, resolved or not.
    pub blocking_queries: Vec<BlockingRecord>,
    /// Attempt history keyed by unit id.
    #[serde(default)]
    pub attempts: BTreeMap<String, FunctionAttempts>,
}

impl StateSnapshot {
    /// Fresh run: `Ignition/Active`, nothing produced yet.
    pub fn initial() -> Self {
        Self::default()
    }

    /// The unresolved record the live `Blocking` substate refers to.
    pub fn pending_blocking(&self) -> Option<&BlockingRecord> {
        let ProtocolSubstate::Blocking { query, .. } = &self.state.substate else {
            return None;
        };
        self.blocking_queries
            .iter()
            .rev()
            .find(|r| !r.resolved && r.phase == self.state.phase && &r.query == query)
    }

    /// Replace the stored record with the same id, or append it.
    pub fn upsert_blocking(&mut self, record: BlockingRecord) {
        match self.blocking_queries.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.blocking_queries.push(record),
        }
    }

    /// BLAKE3 hex digest of the canonical JSON form.
    pub fn checksum(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// On-disk document: the snapshot plus versioning metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub schema_version: String,
    pub persisted_at: DateTime<Utc>,
    pub checksum: String,
    #[serde(flatten)]
    pub snapshot: StateSnapshot,
}

impl PersistedSnapshot {
    pub fn new(snapshot: StateSnapshot, persisted_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            schema_version: SCHEMA_VERSION.to_string(),
            persisted_at,
            checksum: snapshot.checksum()?,
            snapshot,
        })
    }
}

/// `major.minor.patch` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub fn current() -> Self {
        // SCHEMA_VERSION is a literal; parsing cannot fail.
        Self::parse(SCHEMA_VERSION).unwrap_or(Self {
            major: 1,
            minor: 0,
            patch: 0,
        })
    }

    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self { major, minor, patch })
    }

    /// Same major and no newer minor than `current`.
    pub fn is_compatible_with(&self, current: &SchemaVersion) -> bool {
        self.major == current.major && self.minor <= current.minor
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{ArtifactTag, ProtocolPhase};

    #[test]
    fn test_schema_version_compatibility() {
        let current = SchemaVersion::parse("1.2.0").unwrap();
        assert!(SchemaVersion::parse("1.0.5").unwrap().is_compatible_with(&current));
        assert!(SchemaVersion::parse("1.2").unwrap().is_compatible_with(&current));
        assert!(!SchemaVersion::parse("1.3.0").unwrap().is_compatible_with(&current));
        assert!(!SchemaVersion::parse("2.0.0").unwrap().is_compatible_with(&current));
        assert!(!SchemaVersion::parse("0.9.0").unwrap().is_compatible_with(&current));
        assert!(SchemaVersion::parse("one.two").is_none());
        assert!(SchemaVersion::parse("1.2.3.4").is_none());
        assert_eq!(SchemaVersion::current().to_string(), SCHEMA_VERSION);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let mut snapshot = StateSnapshot::initial();
        let before = snapshot.checksum().unwrap();
        assert_eq!(before, snapshot.checksum().unwrap());
        snapshot.artifacts.insert(ArtifactTag::Spec);
        assert_ne!(before, snapshot.checksum().unwrap());
    }

    #[test]
    fn test_pending_blocking_matches_live_query() {
        let now = Utc::now();
        let mut snapshot = StateSnapshot::initial();
        snapshot.state = ProtocolState::active(ProtocolPhase::Lattice).with_substate(
            ProtocolSubstate::Blocking {
                query: "Approve architecture?".into(),
                options: None,
                blocked_at: now,
                timeout_ms: None,
                escalated: false,
            },
        );
        let mut old = BlockingRecord::new(ProtocolPhase::Lattice, "Approve architecture?", now);
        old.resolve("No", now);
        let live = BlockingRecord::new(ProtocolPhase::Lattice, "Approve architecture?", now);
        snapshot.upsert_blocking(old);
        snapshot.upsert_blocking(live.clone());

        assert_eq!(snapshot.pending_blocking(), Some(&live));

        let mut resolved = live.clone();
        resolved.resolve("Yes", now);
        snapshot.upsert_blocking(resolved);
        assert_eq!(snapshot.blocking_queries.len(), 2);
        assert!(snapshot.pending_blocking().is_none());
    }

    #[test]
    fn test_document_is_flat() {
        let doc = PersistedSnapshot::new(StateSnapshot::initial(), Utc::now()).unwrap();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["schema_version"], SCHEMA_VERSION);
        assert_eq!(value["state"]["phase"], "ignition");
        assert_eq!(value["state"]["substate"]["kind"], "active");
        assert!(value["blocking_queries"].as_array().unwrap().is_empty());
    }
}
