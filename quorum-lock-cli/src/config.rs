//! Contender configuration.
//!
//! Layering, lowest to highest: built-in defaults, a TOML or JSON file,
//! `QUORUM_LOCK_REDIS_*` variables (after `.env` is loaded), then flags.

use quorum_lock_core::config::duration_ms;
use quorum_lock_core::{BackoffConfig, LockConfig};
use quorum_lock_redis::RedisClusterConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CliError, CliResult};

/// Everything one contender process needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Resource name shared by all contenders.
    pub key: String,
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// Shortest simulated critical section.
    #[serde(rename = "work_min_ms", with = "duration_ms")]
    pub work_min: Duration,
    /// Longest simulated critical section.
    #[serde(rename = "work_max_ms", with = "duration_ms")]
    pub work_max: Duration,
    pub lock: LockConfig,
    pub redis: RedisClusterConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            key: "my_lock_key".to_string(),
            ttl: Duration::from_secs(10),
            work_min: Duration::from_secs(1),
            work_max: Duration::from_secs(5),
            lock: LockConfig {
                max_attempts: 100,
                backoff: BackoffConfig::new(
                    Duration::from_secs(1),
                    Duration::from_secs(10),
                    Duration::from_secs(1),
                ),
                ..LockConfig::default()
            },
            redis: RedisClusterConfig::default(),
        }
    }
}

/// Supported config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Toml,
    Json,
}

impl FileFormat {
    /// Pick a format from the file extension.
    pub fn from_path(path: &Path) -> CliResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(FileFormat::Toml),
            Some("json") => Ok(FileFormat::Json),
            other => Err(CliError::Config(format!(
                "unsupported config file extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

impl AppConfig {
    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> CliResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.redis.apply_env();
        Ok(config)
    }

    /// Parse a TOML or JSON file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> CliResult<Self> {
        let format = FileFormat::from_path(path)?;
        let content = fs::read_to_string(path)?;
        let parse_error = |message: String| CliError::Parse {
            path: path.display().to_string(),
            message,
        };

        match format {
            FileFormat::Toml => toml::from_str(&content).map_err(|e| parse_error(e.to_string())),
            FileFormat::Json => {
                serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))
            }
        }
    }

    /// Check the combined configuration before any store is contacted.
    pub fn validate(&self) -> CliResult<()> {
        if self.key.is_empty() {
            return Err(CliError::Config("key must not be empty".to_string()));
        }

        self.lock
            .validate()
            .map_err(|e| CliError::Config(format!("[lock] {}", e)))?;
        self.redis
            .validate()
            .map_err(|e| CliError::Config(format!("[redis] {}", e)))?;

        let drift = self.lock.drift_margin(self.ttl);
        if self.ttl <= drift {
            return Err(CliError::Config(format!(
                "ttl {:?} must exceed the drift margin {:?}",
                self.ttl, drift
            )));
        }

        if self.work_min > self.work_max {
            return Err(CliError::Config(format!(
                "work_min ({:?}) exceeds work_max ({:?})",
                self.work_min, self.work_max
            )));
        }

        Ok(())
    }

    /// Render in the given format.
    pub fn render(&self, format: FileFormat) -> CliResult<String> {
        match format {
            FileFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| CliError::Config(e.to_string()))
            }
            FileFormat::Json => {
                serde_json::to_string_pretty(self).map_err(|e| CliError::Config(e.to_string()))
            }
        }
    }
}
