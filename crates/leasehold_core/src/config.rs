//! Store configuration.
//!
//! # Responsibility
//! - Hold tunables shared by connection bootstrap and lease locking.
//! - Parse and validate JSON configuration documents.
//!
//! # Invariants
//! - Every field has a default; an empty JSON object is a valid config.
//! - `validate()` must pass before options reach a store.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

const DEFAULT_LEASE_MS: u64 = 30_000;
const DEFAULT_INSERT_RACE_ATTEMPTS: u32 = 2;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Errors from loading or validating `StoreOptions`.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Tunables for SQLite bootstrap and lease locking.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Lease used when `acquire` is called without a duration.
    pub default_lease_ms: u64,
    /// Attempts allowed for the first-row insert race before giving up.
    pub insert_race_attempts: u32,
    /// How long a connection waits for the database write lock.
    pub busy_timeout_ms: u64,
    /// Log level override for binaries; library code ignores it.
    pub log_level: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            default_lease_ms: DEFAULT_LEASE_MS,
            insert_race_attempts: DEFAULT_INSERT_RACE_ATTEMPTS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            log_level: None,
        }
    }
}

impl StoreOptions {
    /// Parses and validates options from a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    /// Reads, parses and validates options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_lease_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_lease_ms must be greater than zero".to_string(),
            ));
        }
        if self.insert_race_attempts == 0 {
            return Err(ConfigError::Invalid(
                "insert_race_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_lease(&self) -> Duration {
        Duration::from_millis(self.default_lease_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
