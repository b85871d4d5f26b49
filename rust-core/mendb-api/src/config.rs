// SPDX-License-Identifier: PMPL-1.0-or-later
//! Service configuration.
//!
//! Layered: built-in defaults, then an optional JSON file named by
//! `MENDDB_CONFIG`, then individual `MENDDB_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use mendb_detect::DetectorConfig;
use mendb_fixer::FixerConfig;
use mendb_state::StateConfig;

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "MENDDB_CONFIG";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MendConfig {
    pub state: StateConfig,
    pub detector: DetectorConfig,
    pub fixer: FixerConfig,
    pub server: ServerConfig,
    /// JSON file to seed the in-memory repository from
    pub seed: Option<PathBuf>,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl MendConfig {
    /// Defaults, then `MENDDB_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file; absent keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `MENDDB_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("MENDDB_QUEUE_CAPACITY") {
            self.state.queue_capacity = parse("MENDDB_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("MENDDB_DETECTION_INTERVAL_SECS") {
            self.detector.interval =
                Duration::from_secs(parse("MENDDB_DETECTION_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("MENDDB_FIX_DELAY_MS") {
            self.fixer.pacing = Duration::from_millis(parse("MENDDB_FIX_DELAY_MS", &v)?);
        }
        if let Some(v) = get("MENDDB_IDLE_INTERVAL_MS") {
            self.fixer.idle_interval = Duration::from_millis(parse("MENDDB_IDLE_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("MENDDB_AUTO_FIX") {
            self.fixer.auto_fix = parse_bool("MENDDB_AUTO_FIX", &v)?;
        }
        if let Some(v) = get("MENDDB_DRY_RUN") {
            self.fixer.dry_run = parse_bool("MENDDB_DRY_RUN", &v)?;
        }
        if let Some(v) = get("MENDDB_BACKUP_BEFORE_FIX") {
            self.fixer.backup_before_fix = parse_bool("MENDDB_BACKUP_BEFORE_FIX", &v)?;
        }
        if let Some(v) = get("MENDDB_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("MENDDB_PORT") {
            self.server.port = parse("MENDDB_PORT", &v)?;
        }
        if let Some(v) = get("MENDDB_SEED") {
            self.seed = Some(PathBuf::from(v));
        }
        if let Some(v) = get("MENDDB_LOG_JSON") {
            self.log_json = parse_bool("MENDDB_LOG_JSON", &v)?;
        }
        Ok(())
    }

    /// Reject zero capacities and intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".to_string()));
        }
        if self.state.recent_capacity == 0 {
            return Err(ConfigError::Invalid("recent_capacity must be at least 1".to_string()));
        }
        if self.fixer.pacing.is_zero() || self.fixer.idle_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "fixer pacing and idle interval must be non-zero".to_string(),
            ));
        }
        self.detector
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
