//! Criticality Protocol control core.
//!
//! Drives a code-generation run through a fixed chain of phases, escalating
//! failed units of work up a ladder of model tiers and halting for human
//! review when automation runs out. All model, compiler and test work goes
//! through [`operations::ExternalOperations`].
//!
//! ```text
//! Ignition → Lattice → CompositionAudit → Injection → Mesoscopic → MassDefect → Complete
//!
//! CompositionAudit ──contradictionReport────► Ignition
//! Injection        ──structuralDefectReport─► Lattice
//! Mesoscopic       ──clusterFailureReport───► Injection
//! ```
//!
//! Modules:
//! - [`phase`]: phase/substate model and transition validation
//! - [`blocking`]: human-in-the-loop queries, resolution and timeouts
//! - [`checkpoint`]: atomic persistence and integrity-checked resume
//! - [`escalation`]: failure classification and retry/escalate/halt decisions
//! - [`orchestrator`]: the tick loop
//! - [`ledger`]: append-only decision ledger
//! - [`telemetry`]: per-phase model-call counters
//! - [`config`]: TOML configuration with environment overrides

pub mod blocking;
pub mod checkpoint;
pub mod config;
pub mod escalation;
pub mod ledger;
pub mod operations;
pub mod orchestrator;
pub mod phase;
pub mod telemetry;

pub use config::ProtocolConfig;
pub use orchestrator::{Orchestrator, StartMode, TickResult};
pub use phase::{ProtocolPhase, ProtocolState, ProtocolSubstate};
