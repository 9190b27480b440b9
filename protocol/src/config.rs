//! Protocol configuration: TOML file plus environment overrides.
//!
//! ```toml
//! [escalation]
//! max_attempts = 8
//!
//! [checkpoint]
//! path = ".criticality/state.json"
//! stale_after_secs = 86400
//!
//! [blocking]
//! default_timeout_ms = 3600000
//! timeout_strategy = "default"
//! default_option = "Yes"
//!
//! [commands]
//! model = "llm-call --model {tier}"   # `{tier}` is replaced per call; also in $CRITICALITY_TIER
//! compile = "cargo build"
//! test = "cargo test"
//! ```
//!
//! Environment overrides: `CRITICALITY_STATE_PATH`, `CRITICALITY_MAX_ATTEMPTS`,
//! `CRITICALITY_STALE_AFTER_SECS`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocking::BlockingConfig;
use crate::checkpoint::IntegrityOptions;
use crate::escalation::EscalationConfig;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "criticality.toml";

pub const ENV_STATE_PATH: &str = "CRITICALITY_STATE_PATH";
pub const ENV_MAX_ATTEMPTS: &str = "CRITICALITY_MAX_ATTEMPTS";
pub const ENV_STALE_AFTER_SECS: &str = "CRITICALITY_STALE_AFTER_SECS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "CONFIG_IO",
            Self::Parse { .. } => "CONFIG_PARSE",
            Self::InvalidValue { .. } => "CONFIG_INVALID_VALUE",
        }
    }
}

/// Checkpoint location and resume policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    pub stale_after_secs: u64,
    pub allow_stale_state: bool,
    /// Optional `.jsonl` file receiving one line per model call.
    pub telemetry_path: Option<PathBuf>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".criticality/state.json"),
            stale_after_secs: 24 * 60 * 60,
            allow_stale_state: true,
            telemetry_path: None,
        }
    }
}

impl CheckpointConfig {
    pub fn integrity_options(&self) -> IntegrityOptions {
        IntegrityOptions {
            stale_after: Duration::from_secs(self.stale_after_secs),
            allow_stale_state: self.allow_stale_state,
        }
    }

    /// Decision ledger file stored next to the checkpoint.
    pub fn ledger_path(&self) -> PathBuf {
        self.path.with_file_name("decisions.json")
    }
}

/// Shell commands backing the external operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Model call; receives the prompt on stdin and the tier in `CRITICALITY_TIER`.
    /// A `{tier}` argument placeholder is replaced with the tier name.
    pub model: String,
    pub compile: String,
    pub test: String,
    /// Run after each completed phase with `CRITICALITY_PHASE` set.
    pub archive: Option<String>,
    /// Run when a blocking query is raised; receives the record JSON on stdin.
    pub notify: Option<String>,
    /// Per-command time limit.
    pub timeout_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            model: "criticality-model".to_string(),
            compile: "cargo build --quiet".to_string(),
            test: "cargo test --quiet".to_string(),
            archive: None,
            notify: None,
            timeout_secs: 600,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub escalation: EscalationConfig,
    pub checkpoint: CheckpointConfig,
    pub blocking: BlockingConfig,
    pub commands: CommandsConfig,
}

impl ProtocolConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Load `explicit` (must exist) or `criticality.toml` (optional), then
    /// apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    tracing::debug!("No {DEFAULT_CONFIG_FILE} found; using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (environment-shaped keys).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = lookup(ENV_STATE_PATH).filter(|p| !p.is_empty()) {
            self.checkpoint.path = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            self.escalation.max_attempts = parse_number(ENV_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_STALE_AFTER_SECS) {
            self.checkpoint.stale_after_secs = parse_number(ENV_STALE_AFTER_SECS, &value)?;
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::TimeoutStrategy;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.escalation.max_attempts, 8);
        assert_eq!(config.escalation.type_retry_limit, 2);
        assert_eq!(config.blocking.timeout_strategy, TimeoutStrategy::Escalate);
        assert!(config.checkpoint.allow_stale_state);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
            [escalation]
            max_attempts = 5

            [blocking]
            timeout_strategy = "fail"
            default_timeout_ms = 1000

            [commands]
            model = "llm --tier $CRITICALITY_TIER"
        "#;
        let config = ProtocolConfig::from_toml_str(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.escalation.max_attempts, 5);
        assert_eq!(config.escalation.test_retry_limit, 3);
        assert_eq!(config.blocking.timeout_strategy, TimeoutStrategy::Fail);
        assert_eq!(config.blocking.default_timeout_ms, Some(1000));
        assert_eq!(config.commands.model, "llm --tier $CRITICALITY_TIER");
        assert_eq!(config.commands.test, "cargo test --quiet");
    }

    #[test]
    fn test_invalid_toml() {
        let err = ProtocolConfig::from_toml_str("[escalation\nmax", Path::new("bad.toml")).unwrap_err();
        assert_eq!(err.code(), "CONFIG_PARSE");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_STATE_PATH, "/tmp/run/state.json"),
            (ENV_MAX_ATTEMPTS, "3"),
            (ENV_STALE_AFTER_SECS, "60"),
        ]);
        let mut config = ProtocolConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.checkpoint.path, PathBuf::from("/tmp/run/state.json"));
        assert_eq!(config.escalation.max_attempts, 3);
        assert_eq!(
            config.checkpoint.integrity_options().stale_after,
            Duration::from_secs(60)
        );
        assert_eq!(config.checkpoint.ledger_path(), PathBuf::from("/tmp/run/decisions.json"));
    }

    #[test]
    fn test_invalid_override() {
        let mut config = ProtocolConfig::default();
        let err = config
            .apply_overrides(|k| (k == ENV_MAX_ATTEMPTS).then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID_VALUE");
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProtocolConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_IO");
    }
}
