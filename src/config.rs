//! Runtime configuration.
//!
//! Every field has a built-in default, so an empty JSON object is a valid
//! configuration. Loaded values must pass [`TagCoreConfig::validate`].

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::Propagation;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TagCoreConfig {
    pub engine: EngineConfig,
    pub notifier: NotifierConfig,
}

/// Configuration engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on waiting for a key lock. `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
    /// Scope used for cascaded removals.
    pub cascade_propagation: Propagation,
    /// Quarantine an entity whose post-commit derived step keeps failing.
    pub quarantine_on_derived_failure: bool,
    /// Extra attempts for a failed derived step before giving up.
    pub derived_step_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: Some(5_000),
            cascade_propagation: Propagation::RequiresNew,
            quarantine_on_derived_failure: true,
            derived_step_retries: 1,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

/// Supervision notifier settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Name of the dispatcher thread; listener workers append their index.
    pub thread_name: String,
    /// Queued events above which a backlog warning is logged.
    pub backlog_warn_threshold: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            thread_name: "tagcore-supervision".to_string(),
            backlog_warn_threshold: 1_000,
        }
    }
}

impl TagCoreConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.lock_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "engine.lock_timeout_ms".to_string(),
                reason: "must be positive; use null to wait forever".to_string(),
            });
        }
        if self.notifier.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "notifier.thread_name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.notifier.backlog_warn_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "notifier.backlog_warn_threshold".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
