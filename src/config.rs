//! Configuration file parser for ~/.config/feedvault/config.toml.
//!
//! The config file is optional; a missing or blank file yields
//! `Config::default()`. Keys that are not fields of [`Config`] are collected
//! during deserialization and logged as warnings.
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::DatabaseOptions;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Archive database file. Defaults to `archive.db` in the config directory.
    pub database_path: Option<PathBuf>,

    /// Maximum pooled SQLite connections.
    pub max_connections: u32,

    /// Milliseconds SQLite waits on a held lock before failing.
    pub busy_timeout_ms: u64,

    /// Where export jobs write their output. Defaults to `exports/` in the
    /// config directory.
    pub export_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            max_connections: 5,
            busy_timeout_ms: 5000,
            export_dir: None,
        }
    }
}

/// On-disk shape: the known keys plus whatever else the file contains.
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    config: Config,
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// `Parse` for invalid TOML or a wrongly typed value, `TooLarge` past
    /// 1 MB, `Io` for any read failure other than a missing file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let Some(content) = read_bounded(path, Self::MAX_FILE_SIZE)? else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        };
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is blank, using defaults");
            return Ok(Self::default());
        }

        let file: ConfigFile = toml::from_str(&content)?;
        for key in file.unknown.keys() {
            tracing::warn!(key = %key, path = %path.display(), "Unknown config key ignored");
        }
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(file.config)
    }

    /// Pool settings derived from this config.
    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            max_connections: self.max_connections,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

/// Read at most `limit` bytes of `path`; `None` when the file does not exist.
fn read_bounded(path: &Path, limit: u64) -> Result<Option<String>, ConfigError> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut content = String::new();
    file.take(limit + 1).read_to_string(&mut content)?;
    if content.len() as u64 > limit {
        return Err(ConfigError::TooLarge(format!(
            "{} is larger than {limit} bytes",
            path.display()
        )));
    }
    Ok(Some(content))
}

// ============================================================================
// Tests
// ============================================================================
