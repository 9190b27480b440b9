//! Escalation Engine: Deterministic Retry/Escalate/Halt Decisions
//!
//! Decides, for every failed unit of generated work, whether to regenerate at
//! the same model tier, move up the ladder, or stop. Pure functions only: no
//! model calls, no I/O.
//!
//! # Escalation Ladder
//!
//! ```text
//! Worker
//!     │
//!     ├─ syntax (recoverable) → retry, with a parse hint from the 2nd attempt
//!     ├─ type ×2 / test ×3 / complexity ×3 → escalate
//!     ├─ syntax (fatal), timeout, semantic → escalate immediately
//!     ├─ security → jump straight to Architect
//!     │
//!     ▼
//! Fallback
//!     │  same rules
//!     ▼
//! Architect
//!     │
//!     └─ exhausted → circuit break (human review for test/complexity/semantic/security)
//!
//! coherence → circuit break on any tier
//! total attempts ≥ max_attempts → circuit break, checked first
//! ```

pub mod attempts;
pub mod classifier;
pub mod engine;
pub mod failure;
pub mod summary;
pub mod tier;

pub use attempts::{
    apply_decision, record_attempt, record_syntax_hint, reset_syntax_hint, FunctionAttempts,
};
pub use classifier::{classify_failure, failing_test_names};
pub use engine::{
    determine_escalation, syntax_hint, EscalationAction, EscalationConfig, EscalationDecision,
    EscalationEngine,
};
pub use failure::{FailureClassification, FailureKind};
pub use summary::generate_failure_summary;
pub use tier::ModelTier;
