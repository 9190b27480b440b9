//! Checkpoint store: atomic save, validated load, never-failing resume.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::integrity::{validate_integrity, IntegrityOptions, IntegrityStatus};
use super::snapshot::{PersistedSnapshot, SchemaVersion, StateSnapshot};
use crate::phase::{ArtifactTag, ProtocolPhase};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Checkpoint is not valid JSON: {message}")]
    Parse { message: String },

    #[error("Checkpoint schema error: {message}")]
    Schema { message: String },

    #[error("Checkpoint file error at {}: {message}", .path.display())]
    File {
        path: PathBuf,
        message: String,
        not_found: bool,
    },

    #[error("Checkpoint validation failed: {message}")]
    Validation { message: String },

    #[error("Checkpoint corrupted: {message}")]
    Corruption { message: String },
}

impl PersistenceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::Schema { .. } => "schema_error",
            Self::File { .. } => "file_error",
            Self::Validation { .. } => "validation_error",
            Self::Corruption { .. } => "corruption_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::File { not_found: true, .. })
    }

    fn file(path: &Path, err: std::io::Error) -> Self {
        Self::File {
            path: path.to_path_buf(),
            not_found: err.kind() == std::io::ErrorKind::NotFound,
            message: err.to_string(),
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Why a resume started from scratch.
#[derive(Debug)]
pub enum CleanStartReason {
    /// No checkpoint on disk.
    NoPriorState,
    /// The checkpoint was unusable; it was moved to `quarantined` when possible.
    Recovered {
        error: PersistenceError,
        quarantined: Option<PathBuf>,
    },
}

#[derive(Debug)]
pub enum ResumeOutcome {
    Resumed {
        snapshot: StateSnapshot,
        warnings: Vec<String>,
    },
    CleanStart {
        reason: CleanStartReason,
    },
}

impl ResumeOutcome {
    /// The snapshot to run from: the resumed one or a fresh start.
    pub fn into_snapshot(self) -> StateSnapshot {
        match self {
            Self::Resumed { snapshot, .. } => snapshot,
            Self::CleanStart { .. } => StateSnapshot::initial(),
        }
    }
}

/// File-backed checkpoint for one protocol run. One writer per path.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    integrity: IntegrityOptions,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, IntegrityOptions::default())
    }

    pub fn with_options(path: impl Into<PathBuf>, integrity: IntegrityOptions) -> Self {
        Self {
            path: path.into(),
            integrity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn temp_path(&self) -> PathBuf {
        sibling(&self.path, ".tmp")
    }

    /// Persist `snapshot` atomically: temp file, fsync, rename.
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<(), PersistenceError> {
        self.save_at(snapshot, Utc::now())
    }

    pub fn save_at(&self, snapshot: &StateSnapshot, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        let document = PersistedSnapshot::new(snapshot.clone(), now).map_err(|e| {
            PersistenceError::Schema {
                message: e.to_string(),
            }
        })?;
        let content = serde_json::to_string_pretty(&document).map_err(|e| PersistenceError::Schema {
            message: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::file(parent, e))?;
        }

        let temp_path = self.temp_path();
        {
            let mut file =
                std::fs::File::create(&temp_path).map_err(|e| PersistenceError::file(&temp_path, e))?;
            file.write_all(content.as_bytes())
                .map_err(|e| PersistenceError::file(&temp_path, e))?;
            file.sync_all()
                .map_err(|e| PersistenceError::file(&temp_path, e))?;
        }
        std::fs::rename(&temp_path, &self.path).map_err(|e| PersistenceError::file(&self.path, e))?;

        debug!(
            path = %self.path.display(),
            phase = %snapshot.state.phase,
            substate = %snapshot.state.substate.kind(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load and validate the snapshot.
    pub fn load(&self) -> Result<StateSnapshot, PersistenceError> {
        self.load_document().map(|doc| doc.snapshot)
    }

    /// Load with versioning metadata.
    pub fn load_document(&self) -> Result<PersistedSnapshot, PersistenceError> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| PersistenceError::file(&self.path, e))?;
        parse_document(&content)
    }

    /// Load, check integrity, and fall back to a clean start on any problem.
    pub fn resume(&self) -> ResumeOutcome {
        self.resume_at(Utc::now())
    }

    pub fn resume_at(&self, now: DateTime<Utc>) -> ResumeOutcome {
        match self.inspect_at(now) {
            Ok((snapshot, warnings)) => {
                for warning in &warnings {
                    warn!(path = %self.path.display(), "Checkpoint warning: {warning}");
                }
                info!(
                    phase = %snapshot.state.phase,
                    substate = %snapshot.state.substate.kind(),
                    "Resumed from checkpoint"
                );
                ResumeOutcome::Resumed { snapshot, warnings }
            }
            Err(e) if e.is_not_found() => {
                info!(path = %self.path.display(), "No prior state; starting fresh");
                ResumeOutcome::CleanStart {
                    reason: CleanStartReason::NoPriorState,
                }
            }
            Err(e) => self.recover_from(e, now),
        }
    }

    /// Load and check integrity without touching the file.
    ///
    /// Returns the snapshot and its integrity warnings; a corrupted or
    /// disallowed-stale checkpoint is a `Validation` error.
    pub fn inspect(&self) -> Result<(StateSnapshot, Vec<String>), PersistenceError> {
        self.inspect_at(Utc::now())
    }

    pub fn inspect_at(&self, now: DateTime<Utc>) -> Result<(StateSnapshot, Vec<String>), PersistenceError> {
        let document = self.load_document()?;
        match validate_integrity(&document.snapshot, document.persisted_at, &self.integrity, now) {
            IntegrityStatus::Corrupted { errors } => Err(PersistenceError::validation(errors.join("; "))),
            status => {
                let warnings = status.warnings().to_vec();
                Ok((document.snapshot, warnings))
            }
        }
    }

    fn recover_from(&self, error: PersistenceError, now: DateTime<Utc>) -> ResumeOutcome {
        let target = sibling(
            &self.path,
            &format!(".corrupt-{}", now.format("%Y%m%dT%H%M%S%.3fZ")),
        );
        let quarantined = match std::fs::rename(&self.path, &target) {
            Ok(()) => Some(target),
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to move corrupt checkpoint aside: {e}");
                None
            }
        };
        warn!(
            path = %self.path.display(),
            code = error.code(),
            error = %error,
            "Checkpoint unusable; starting fresh"
        );
        ResumeOutcome::CleanStart {
            reason: CleanStartReason::Recovered { error, quarantined },
        }
    }

    /// Remove the checkpoint (explicit reset).
    pub fn clear(&self) -> Result<(), PersistenceError> {
        for path in [self.path.clone(), self.temp_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PersistenceError::file(&path, e)),
            }
        }
        info!(path = %self.path.display(), "Checkpoint cleared");
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Parse and validate a checkpoint document.
pub fn parse_document(content: &str) -> Result<PersistedSnapshot, PersistenceError> {
    let value: Value = serde_json::from_str(content).map_err(|e| PersistenceError::Parse {
        message: e.to_string(),
    })?;
    validate_structure(&value)?;

    let document: PersistedSnapshot =
        serde_json::from_value(value).map_err(|e| PersistenceError::validation(e.to_string()))?;

    let expected = document
        .snapshot
        .checksum()
        .map_err(|e| PersistenceError::validation(e.to_string()))?;
    if expected != document.checksum {
        return Err(PersistenceError::Corruption {
            message: format!(
                "checksum mismatch (stored {}, computed {})",
                document.checksum, expected
            ),
        });
    }
    Ok(document)
}

fn validate_structure(value: &Value) -> Result<(), PersistenceError> {
    let root = value.as_object().ok_or_else(|| PersistenceError::Schema {
        message: "document is not an object".to_string(),
    })?;

    let version = root
        .get("schema_version")
        .and_then(Value::as_str)
        .ok_or_else(|| PersistenceError::Schema {
            message: "missing schema_version".to_string(),
        })?;
    let parsed = SchemaVersion::parse(version).ok_or_else(|| PersistenceError::Schema {
        message: format!("malformed schema_version '{version}'"),
    })?;
    let current = SchemaVersion::current();
    if !parsed.is_compatible_with(&current) {
        return Err(PersistenceError::Schema {
            message: format!("schema_version {parsed} is incompatible with {current}"),
        });
    }
    for field in ["persisted_at", "checksum"] {
        if !root.get(field).is_some_and(Value::is_string) {
            return Err(PersistenceError::Schema {
                message: format!("missing {field}"),
            });
        }
    }

    let state = object_field(root, "state")?;
    let phase = str_field(state, "phase", "state")?;
    if ProtocolPhase::parse(phase).is_none() {
        return Err(PersistenceError::validation(format!("unknown phase '{phase}'")));
    }
    let substate = object_field(state, "substate")?;
    let required: &[&str] = match str_field(substate, "kind", "substate")? {
        "active" => &[],
        "blocking" => &["query", "blocked_at"],
        "failed" => &["error", "failed_at", "recoverable"],
        other => {
            return Err(PersistenceError::validation(format!(
                "unknown substate kind '{other}'"
            )))
        }
    };
    for field in required {
        if substate.get(*field).map_or(true, Value::is_null) {
            return Err(PersistenceError::validation(format!(
                "substate missing required field '{field}'"
            )));
        }
    }

    let artifacts = array_field(root, "artifacts")?;
    for tag in artifacts {
        let tag = tag
            .as_str()
            .ok_or_else(|| PersistenceError::validation("artifact tag is not a string"))?;
        if ArtifactTag::parse(tag).is_none() {
            return Err(PersistenceError::validation(format!("unknown artifact tag '{tag}'")));
        }
    }

    let mut ids = HashSet::new();
    for record in array_field(root, "blocking_queries")? {
        let record = record
            .as_object()
            .ok_or_else(|| PersistenceError::validation("blocking record is not an object"))?;
        let id = str_field(record, "id", "blocking record")?;
        if id.trim().is_empty() || !ids.insert(id) {
            return Err(PersistenceError::validation(format!(
                "blocking record id '{id}' is empty or duplicated"
            )));
        }
        let phase = str_field(record, "phase", "blocking record")?;
        if ProtocolPhase::parse(phase).is_none() {
            return Err(PersistenceError::validation(format!(
                "blocking record {id} has unknown phase '{phase}'"
            )));
        }
        if str_field(record, "query", "blocking record")?.trim().is_empty() {
            return Err(PersistenceError::validation(format!(
                "blocking record {id} has an empty query"
            )));
        }
        str_field(record, "blocked_at", "blocking record")?;
        let resolved = record
            .get("resolved")
            .and_then(Value::as_bool)
            .ok_or_else(|| PersistenceError::validation(format!("blocking record {id} missing 'resolved'")))?;
        if resolved && !record.get("resolution").is_some_and(Value::is_string) {
            return Err(PersistenceError::validation(format!(
                "blocking record {id} is resolved without a resolution"
            )));
        }
    }

    Ok(())
}

type Object = serde_json::Map<String, Value>;

fn object_field<'a>(parent: &'a Object, field: &str) -> Result<&'a Object, PersistenceError> {
    parent
        .get(field)
        .and_then(Value::as_object)
        .ok_or_else(|| PersistenceError::validation(format!("missing or malformed '{field}'")))
}

fn array_field<'a>(parent: &'a Object, field: &str) -> Result<&'a Vec<Value>, PersistenceError> {
    parent
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| PersistenceError::validation(format!("missing or malformed '{field}'")))
}

fn str_field<'a>(parent: &'a Object, field: &str, owner: &str) -> Result<&'a str, PersistenceError> {
    parent
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| PersistenceError::validation(format!("{owner} missing '{field}'")))
}
