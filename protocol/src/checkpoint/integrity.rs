//! Resume-time integrity checks on a loaded snapshot.
//!
//! Structural problems that survived deserialization are errors; age and
//! expired timeouts are warnings (staleness becomes an error only when stale
//! state is disallowed).

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::StateSnapshot;
use crate::blocking::check_timeout;
use crate::phase::ProtocolSubstate;

/// Knobs for [`validate_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityOptions {
    /// Age beyond which a snapshot counts as stale.
    pub stale_after: Duration,
    /// When false, a stale snapshot is an error instead of a warning.
    pub allow_stale_state: bool,
}

impl Default for IntegrityOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(24 * 60 * 60),
            allow_stale_state: true,
        }
    }
}

/// Integrity check result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// Snapshot is valid and can be resumed.
    Valid,
    /// Snapshot has minor issues but is resumable.
    Recoverable { warnings: Vec<String> },
    /// Snapshot must not be resumed.
    Corrupted { errors: Vec<String> },
}

impl IntegrityStatus {
    /// Whether resume is safe.
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Valid | Self::Recoverable { .. })
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Self::Recoverable { warnings } => warnings,
            _ => &[],
        }
    }
}

/// Check `snapshot`, persisted at `persisted_at`, as of `now`.
pub fn validate_integrity(
    snapshot: &StateSnapshot,
    persisted_at: DateTime<Utc>,
    opts: &IntegrityOptions,
    now: DateTime<Utc>,
) -> IntegrityStatus {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    // Blocking records
    let mut seen = HashSet::new();
    for record in &snapshot.blocking_queries {
        if record.id.trim().is_empty() {
            errors.push("blocking record with empty id".to_string());
        } else if !seen.insert(record.id.as_str()) {
            errors.push(format!("duplicate blocking record id {}", record.id));
        }
        if record.query.trim().is_empty() {
            errors.push(format!("blocking record {} has an empty query", record.id));
        }
        if record.resolved && record.resolution.is_none() {
            errors.push(format!("blocking record {} is resolved without a resolution", record.id));
        }
    }

    // Live substate must be backed by a record
    if let ProtocolSubstate::Blocking { query, .. } = &snapshot.state.substate {
        match snapshot.pending_blocking() {
            Some(record) => {
                if let Some(status) = check_timeout(record, now) {
                    if status.expired {
                        warnings.push(format!(
                            "blocking query {} timed out {}ms ago",
                            record.id,
                            status.elapsed_ms.saturating_sub(record.timeout_ms.unwrap_or(0))
                        ));
                    }
                }
            }
            None => errors.push(format!(
                "blocking substate has no unresolved record for query '{query}'"
            )),
        }
    }

    if snapshot.state.is_complete() && !snapshot.state.substate.is_active() {
        errors.push(format!(
            "complete protocol cannot be {}",
            snapshot.state.substate.kind()
        ));
    }

    // Staleness
    let age = now - persisted_at;
    if age < chrono::Duration::zero() {
        warnings.push(format!("snapshot persisted in the future ({persisted_at})"));
    } else if let Ok(age) = age.to_std() {
        if age > opts.stale_after {
            let message = format!(
                "snapshot is {}s old (stale after {}s)",
                age.as_secs(),
                opts.stale_after.as_secs()
            );
            if opts.allow_stale_state {
                warnings.push(message);
            } else {
                errors.push(message);
            }
        }
    }

    if !errors.is_empty() {
        IntegrityStatus::Corrupted { errors }
    } else if !warnings.is_empty() {
        IntegrityStatus::Recoverable { warnings }
    } else {
        IntegrityStatus::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::BlockingRecord;
    use crate::phase::{ProtocolPhase, ProtocolState};

    fn blocked(now: DateTime<Utc>, timeout_ms: Option<u64>) -> StateSnapshot {
        let record = BlockingRecord::new(ProtocolPhase::Lattice, "Approve architecture?", now)
            .with_timeout(timeout_ms);
        StateSnapshot {
            state: ProtocolState::active(ProtocolPhase::Lattice).with_substate(
                ProtocolSubstate::Blocking {
                    query: record.query.clone(),
                    options: None,
                    blocked_at: now,
                    timeout_ms,
                    escalated: false,
                },
            ),
            blocking_queries: vec![record],
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_snapshot_is_valid() {
        let now = Utc::now();
        let status = validate_integrity(&StateSnapshot::initial(), now, &IntegrityOptions::default(), now);
        assert_eq!(status, IntegrityStatus::Valid);
    }

    #[test]
    fn test_stale_snapshot_warns_or_fails() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(3);
        let snapshot = StateSnapshot::initial();

        let status = validate_integrity(&snapshot, old, &IntegrityOptions::default(), now);
        assert!(status.can_resume());
        assert_eq!(status.warnings().len(), 1);

        let strict = IntegrityOptions {
            allow_stale_state: false,
            ..Default::default()
        };
        let status = validate_integrity(&snapshot, old, &strict, now);
        assert!(!status.can_resume());
    }

    #[test]
    fn test_expired_blocking_timeout_warns() {
        let now = Utc::now();
        let snapshot = blocked(now - chrono::Duration::minutes(10), Some(60_000));
        let status = validate_integrity(&snapshot, now, &IntegrityOptions::default(), now);
        assert!(status.can_resume());
        assert!(status.warnings()[0].contains("timed out"), "{status:?}");
    }

    #[test]
    fn test_blocking_without_record_is_corrupted() {
        let now = Utc::now();
        let mut snapshot = blocked(now, None);
        snapshot.blocking_queries.clear();
        let status = validate_integrity(&snapshot, now, &IntegrityOptions::default(), now);
        assert!(matches!(status, IntegrityStatus::Corrupted { .. }));
    }

    #[test]
    fn test_malformed_records_are_errors() {
        let now = Utc::now();
        let mut snapshot = blocked(now, None);
        let mut dup = snapshot.blocking_queries[0].clone();
        dup.resolved = true;
        snapshot.blocking_queries.push(dup);

        match validate_integrity(&snapshot, now, &IntegrityOptions::default(), now) {
            IntegrityStatus::Corrupted { errors } => {
                assert!(errors.iter().any(|e| e.contains("duplicate")), "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("without a resolution")), "{errors:?}");
            }
            other => panic!("expected corrupted, got {other:?}"),
        }
    }
}
