//! Checkpointed persistence with integrity recovery.

pub mod integrity;
pub mod snapshot;
pub mod store;

pub use integrity::{validate_integrity, IntegrityOptions, IntegrityStatus};
pub use snapshot::{PersistedSnapshot, SchemaVersion, StateSnapshot, SCHEMA_VERSION};
pub use store::{parse_document, CheckpointStore, CleanStartReason, PersistenceError, ResumeOutcome};
