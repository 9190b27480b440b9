//! Persisted record of a blocking query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::ProtocolPhase;

/// A request for a human decision.
///
/// Carries the question and the answer only. Once `resolved` is set the
/// record is never changed again, and records are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingRecord {
    /// Unique id (UUID v4)
    pub id: String,

    /// Phase the protocol was in when it blocked
    pub phase: ProtocolPhase,

    /// Question for the human
    pub query: String,

    /// Allowed answers; free text is accepted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,

    pub blocked_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Set when an expired query was re-raised
    #[serde(default)]
    pub escalated: bool,

    pub resolved: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BlockingRecord {
    pub fn new(phase: ProtocolPhase, query: impl Into<String>, blocked_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phase,
            query: query.into(),
            options: None,
            blocked_at,
            timeout_ms: None,
            escalated: false,
            resolved: false,
            resolution: None,
            resolved_at: None,
        }
    }

    pub fn with_options(mut self, options: Option<Vec<String>>) -> Self {
        self.options = options;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Whether `selection` is an acceptable answer.
    pub fn accepts(&self, selection: &str) -> bool {
        match &self.options {
            Some(options) if !options.is_empty() => options.iter().any(|o| o == selection),
            _ => !selection.trim().is_empty(),
        }
    }

    pub(crate) fn resolve(&mut self, resolution: impl Into<String>, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolution = Some(resolution.into());
        self.resolved_at = Some(at);
    }
}
