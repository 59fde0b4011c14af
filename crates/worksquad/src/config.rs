//! Configuration management for worksquad.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/worksquad/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devserver::DevServerTimings;

/// Hard ceiling on concurrently managed instances.
pub const MAX_INSTANCES_LIMIT: usize = 10;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_instances must be between 1 and {MAX_INSTANCES_LIMIT}, got {0}")]
    InvalidMaxInstances(usize),

    #[error("{name} must be greater than 0")]
    ZeroInterval { name: &'static str },

    #[error("program is empty")]
    EmptyProgram,

    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Storage and logging.
    pub daemon: DaemonConfig,

    /// Defaults for new instances.
    pub session: SessionConfig,

    /// Background sweep intervals.
    pub poller: PollerConfig,

    /// Dev server timing.
    pub dev_server: DevServerTimingConfig,
}

/// Storage and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for state files, worktrees and logs.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Defaults applied to new instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Agent command launched in each instance.
    pub program: String,

    /// Confirm agent prompts automatically.
    pub auto_yes: bool,

    /// Maximum number of concurrent instances.
    pub max_instances: usize,

    /// Prefix for instance branches, e.g. `alice/`.
    pub branch_prefix: String,
}

/// Background sweep intervals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollerConfig {
    /// Status, diff and dev server health sweep.
    pub metadata_interval_ms: u64,

    /// Preview refresh.
    pub preview_interval_ms: u64,
}

/// Dev server timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DevServerTimingConfig {
    /// Time between Ctrl-C and force-closing the session.
    pub grace_period_ms: u64,

    /// Time a launched session gets to appear.
    pub start_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            auto_yes: false,
            max_instances: MAX_INSTANCES_LIMIT,
            branch_prefix: default_branch_prefix(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            metadata_interval_ms: 500,
            preview_interval_ms: 100,
        }
    }
}

impl Default for DevServerTimingConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 2000,
            start_timeout_ms: 2000,
        }
    }
}

impl PollerConfig {
    pub fn metadata_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_interval_ms)
    }

    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms)
    }
}

impl From<&DevServerTimingConfig> for DevServerTimings {
    fn from(config: &DevServerTimingConfig) -> Self {
        Self {
            grace_period: Duration::from_millis(config.grace_period_ms),
            start_timeout: Duration::from_millis(config.start_timeout_ms),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worksquad")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worksquad")
}

/// `<user>/` from the environment, falling back to `worksquad/`.
fn default_branch_prefix() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let user: String = user
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if user.is_empty() {
        "worksquad/".to_string()
    } else {
        format!("{}/", user.to_lowercase())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WORKSQUAD_PROGRAM: Override the agent command
    /// - WORKSQUAD_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WORKSQUAD_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(program) = std::env::var("WORKSQUAD_PROGRAM") {
            if !program.is_empty() {
                tracing::info!(program = %program, "Overriding program from environment");
                self.session.program = program;
            }
        }

        if let Ok(level) = std::env::var("WORKSQUAD_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(level = %level, "Overriding log_level from environment");
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("WORKSQUAD_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!(data_dir = %dir, "Overriding data_dir from environment");
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.session.max_instances;
        if !(1..=MAX_INSTANCES_LIMIT).contains(&max) {
            return Err(ConfigError::InvalidMaxInstances(max));
        }

        if self.poller.metadata_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                name: "metadata_interval_ms",
            });
        }
        if self.poller.preview_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                name: "preview_interval_ms",
            });
        }
        if self.dev_server.start_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                name: "start_timeout_ms",
            });
        }

        // Only the executable has to exist; the rest are its arguments.
        let executable = self
            .session
            .program
            .split_whitespace()
            .next()
            .ok_or(ConfigError::EmptyProgram)?;
        let path = Path::new(executable);
        let found = if path.is_absolute() {
            path.exists()
        } else {
            which::which(executable).is_ok()
        };
        if !found {
            return Err(ConfigError::ProgramNotFound(executable.to_string()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("logs")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
