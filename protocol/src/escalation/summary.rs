//! Fresh-context failure summaries for regenerated prompts.

use super::failure::FailureClassification;

/// Describe the last failure of `unit_id` for the next prompt.
///
/// Only the unit signature and the failure itself are carried forward; the
/// previous attempt's output and reasoning are deliberately absent.
pub fn generate_failure_summary(
    unit_id: &str,
    signature: &str,
    failure: &FailureClassification,
) -> String {
    let guidance = match failure {
        FailureClassification::Syntax { .. } => {
            "Regenerate the unit from scratch with syntactically valid code."
        }
        FailureClassification::Type { .. } => {
            "Regenerate the unit so that it type-checks against the signature."
        }
        FailureClassification::Test { .. } => {
            "Regenerate the unit so that the listed tests pass."
        }
        FailureClassification::Timeout { .. } => {
            "Regenerate a simpler unit that completes within the limit."
        }
        FailureClassification::Semantic { .. } => {
            "Regenerate the unit honoring every stated contract."
        }
        FailureClassification::Complexity { .. } => {
            "Regenerate the unit within the expected complexity bound."
        }
        FailureClassification::Security { .. } => {
            "Regenerate the unit without the reported vulnerability."
        }
        FailureClassification::Coherence { .. } => {
            "Regenerate the unit consistently with the conflicting units."
        }
    };

    format!(
        "Unit: {unit_id}\nSignature: {signature}\nPrevious attempt failed ({kind}): {detail}\n{guidance}",
        kind = failure.kind(),
        detail = failure.describe(),
    )
}
