//! Configuration file support for iterlog.
//!
//! Loads `iterlog.toml` from the working directory, falling back to
//! `<config_dir>/iterlog/iterlog.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use iterlog_logging::LogFormat;
use iterlog_sessions::StoreOptions;
use serde::Deserialize;

/// The config file name
pub const CONFIG_FILE_NAME: &str = "iterlog.toml";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration loaded from `iterlog.toml`
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// SQLite database file (default: the user data directory)
    pub database_path: Option<PathBuf>,
    /// Tracing filter, e.g. `info` or `iterlog_sessions=debug`
    pub log_level: Option<String>,
    /// pretty, json, compact or quiet
    pub log_format: Option<String>,
    /// Directory for rolling trace files
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Bytes counted per image when a reading has no recorded size
    pub image_estimate_bytes: Option<u64>,
    /// Events held while session pointers load
    pub pending_capacity: Option<usize>,
    /// Entries kept in the in-memory log ring
    pub logger_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// How often a watched file is re-checked without a change notification
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
}

impl ProjectConfig {
    /// Load configuration from the working directory.
    ///
    /// Returns:
    /// - `Ok(Some(config))` if file exists and parses successfully
    /// - `Ok(None)` if file does not exist
    /// - `Err(...)` if file exists but fails to parse (hard error)
    pub fn load(working_dir: &Path) -> Result<Option<Self>> {
        Self::load_file(&working_dir.join(CONFIG_FILE_NAME))
    }

    /// Working directory first, then the user config directory.
    pub fn discover(working_dir: &Path) -> Result<Option<Self>> {
        if let Some(config) = Self::load(working_dir)? {
            return Ok(Some(config));
        }

        match dirs::config_dir() {
            Some(dir) => Self::load_file(&dir.join("iterlog").join(CONFIG_FILE_NAME)),
            None => Ok(None),
        }
    }

    fn load_file(config_path: &Path) -> Result<Option<Self>> {
        if !config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: ProjectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Ok(Some(config))
    }

    pub fn log_format(&self) -> Result<Option<LogFormat>> {
        self.log_format
            .as_deref()
            .map(|s| s.parse::<LogFormat>().map_err(anyhow::Error::msg))
            .transpose()
    }

    pub fn store_options(&self) -> StoreOptions {
        let defaults = StoreOptions::default();
        StoreOptions {
            image_estimate_bytes: self
                .store
                .image_estimate_bytes
                .unwrap_or(defaults.image_estimate_bytes),
            pending_capacity: self
                .store
                .pending_capacity
                .unwrap_or(defaults.pending_capacity),
        }
    }

    pub fn logger_capacity(&self) -> usize {
        self.store
            .logger_capacity
            .unwrap_or(iterlog_logging::DEFAULT_CAPACITY)
    }

    pub fn poll_interval(&self) -> Duration {
        self.watch.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL)
    }
}
