//! Raw operation failure → [`FailureClassification`].
//!
//! Pattern-based, like compiler diagnostic routing: cheap regexes decide the
//! failure kind, and the kind drives the escalation table.

use std::sync::LazyLock;

use regex::Regex;

use super::failure::FailureClassification;
use crate::operations::{FailureStage, OperationFailure};

static PARSE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(expected one of|expected `|unexpected token|unclosed delimiter|unterminated|unexpected end of file|unexpected eof|parse error|syntax error)",
    )
    .unwrap()
});

static FATAL_PARSE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(unexpected end of file|unexpected eof|unterminated)").unwrap()
});

static TIMEOUT_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)timed out after\s+(\d+(?:\.\d+)?\s*(?:seconds?|secs?|s|minutes?|min|ms|m))\b").unwrap()
});

/// A finding line emitted by an audit tool: `security: ...` or `vulnerability: ...`.
static SECURITY_MARKER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*(?:security|vulnerability)\s*:\s*(\S.*)$").unwrap());

static FAILED_TEST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*test (\S+) \.\.\. FAILED").unwrap());

/// Classify a failed external operation.
///
/// An explicit classification from the collaborator always wins. Timeouts
/// come only from the runner's `timed_out` flag and security problems only
/// from marker lines, so identifiers in compiler or test output never change
/// the kind.
pub fn classify_failure(failure: &OperationFailure) -> FailureClassification {
    if let Some(classification) = &failure.classification {
        return classification.clone();
    }

    let message = failure.message.as_str();

    if failure.timed_out {
        let limit = TIMEOUT_LIMIT_PATTERN
            .captures(message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return FailureClassification::Timeout {
            resource: failure.stage.as_str().to_string(),
            limit,
        };
    }

    let failing_tests = failing_test_names(message);
    if failure.stage == FailureStage::Tests && !failing_tests.is_empty() {
        return FailureClassification::Test { failing_tests };
    }

    if failure.stage == FailureStage::Compilation && PARSE_PATTERN.is_match(message) {
        return FailureClassification::Syntax {
            message: first_line(message),
            recoverable: !FATAL_PARSE_PATTERN.is_match(message),
        };
    }

    if let Some(finding) = SECURITY_MARKER_PATTERN.captures(message).and_then(|c| c.get(1)) {
        return FailureClassification::Security {
            vulnerability: finding.as_str().trim().to_string(),
        };
    }

    match failure.stage {
        FailureStage::Compilation => FailureClassification::Type {
            compiler_error: first_line(message),
        },
        FailureStage::Tests => FailureClassification::Test { failing_tests },
        FailureStage::ModelCall | FailureStage::Archive => FailureClassification::Semantic {
            violation: first_line(message),
        },
    }
}

/// Names from `test <name> ... FAILED` lines, in order of appearance.
pub fn failing_test_names(output: &str) -> Vec<String> {
    FAILED_TEST_PATTERN
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn first_line(message: &str) -> String {
    message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}
