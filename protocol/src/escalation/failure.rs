//! Failure classification fed into the escalation engine.

use serde::{Deserialize, Serialize};

/// Why a unit of generated work failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureClassification {
    /// Generated code did not parse.
    Syntax { message: String, recoverable: bool },
    /// Generated code parsed but failed type checking.
    Type { compiler_error: String },
    /// Tests ran and some failed.
    Test { failing_tests: Vec<String> },
    /// An operation exceeded its time budget.
    Timeout { resource: String, limit: String },
    /// A contract or invariant was violated.
    Semantic { violation: String },
    /// Measured complexity exceeded the expected bound.
    Complexity { expected: String, measured: String },
    /// A security problem was detected in the output.
    Security { vulnerability: String },
    /// Units disagree with each other.
    Coherence { conflicting_units: Vec<String> },
}

/// Discriminant of [`FailureClassification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Syntax,
    Type,
    Test,
    Timeout,
    Semantic,
    Complexity,
    Security,
    Coherence,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Type => "type",
            Self::Test => "test",
            Self::Timeout => "timeout",
            Self::Semantic => "semantic",
            Self::Complexity => "complexity",
            Self::Security => "security",
            Self::Coherence => "coherence",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FailureClassification {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Syntax { .. } => FailureKind::Syntax,
            Self::Type { .. } => FailureKind::Type,
            Self::Test { .. } => FailureKind::Test,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Semantic { .. } => FailureKind::Semantic,
            Self::Complexity { .. } => FailureKind::Complexity,
            Self::Security { .. } => FailureKind::Security,
            Self::Coherence { .. } => FailureKind::Coherence,
        }
    }

    /// One-line description used in decision reasons and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Syntax {
                message,
                recoverable,
            } => {
                if *recoverable {
                    format!("syntax error: {message}")
                } else {
                    format!("unrecoverable syntax error: {message}")
                }
            }
            Self::Type { compiler_error } => format!("type error: {compiler_error}"),
            Self::Test { failing_tests } => {
                format!("{} failing test(s): {}", failing_tests.len(), failing_tests.join(", "))
            }
            Self::Timeout { resource, limit } => format!("{resource} timed out (limit {limit})"),
            Self::Semantic { violation } => format!("contract violation: {violation}"),
            Self::Complexity { expected, measured } => {
                format!("complexity {measured} exceeds expected {expected}")
            }
            Self::Security { vulnerability } => format!("security issue: {vulnerability}"),
            Self::Coherence { conflicting_units } => {
                format!("incoherent with: {}", conflicting_units.join(", "))
            }
        }
    }
}

impl std::fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_uses_kind_tag() {
        let failure = FailureClassification::Coherence {
            conflicting_units: vec!["a".into(), "b".into()],
        };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"kind\":\"coherence\""), "JSON: {json}");
        assert!(json.contains("conflicting_units"), "JSON: {json}");

        let restored: FailureClassification = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, failure);
        assert_eq!(restored.kind(), FailureKind::Coherence);
    }

    #[test]
    fn test_describe() {
        let failure = FailureClassification::Test {
            failing_tests: vec!["parses_empty".into()],
        };
        assert_eq!(failure.to_string(), "1 failing test(s): parses_empty");
    }
}
