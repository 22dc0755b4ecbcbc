//! TOML Configuration File Support
//!
//! Centralized configuration loading for the stream engine, supporting a
//! TOML file at `~/.config/genstream/genstream.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest
//! first):
//! 1. Environment variables (`GENSTREAM_*`)
//! 2. TOML configuration file
//! 3. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file follows the XDG Base Directory specification:
//! `$XDG_CONFIG_HOME/genstream/genstream.toml` (typically
//! `~/.config/genstream/genstream.toml`).
//!
//! # Example Configuration
//!
//! ```toml
//! [limits]
//! max_concurrent_global = 32
//! max_concurrent_per_session = 2
//! connection_queue_size = 256
//!
//! [cancel]
//! grace_ms = 5000
//!
//! [retry]
//! retries = 2
//! base_delay_ms = 250
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::RetryPolicy;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Concurrency limits section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsToml {
    /// Maximum concurrent generations across all sessions
    pub max_concurrent_global: Option<usize>,

    /// Maximum concurrent generations per session (0 = unlimited)
    pub max_concurrent_per_session: Option<usize>,

    /// Per-connection event queue size
    pub connection_queue_size: Option<usize>,
}

/// Cancellation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelToml {
    /// Grace period for a provider to acknowledge cancellation, in ms
    pub grace_ms: Option<u64>,
}

/// Retry section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Retry attempts after the initial request
    pub retries: Option<u32>,

    /// Base backoff delay in milliseconds
    pub base_delay_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Concurrency limits section
    pub limits: LimitsToml,

    /// Cancellation section
    pub cancel: CancelToml,

    /// Retry section
    pub retry: RetryToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Runtime configuration for the stream engine
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Maximum concurrent generations across all sessions
    pub max_concurrent_global: usize,

    /// Maximum concurrent generations per session (0 = unlimited)
    pub max_concurrent_per_session: usize,

    /// Per-connection event queue size
    pub connection_queue_size: usize,

    /// Grace period for a provider to acknowledge cancellation
    pub cancel_grace: Duration,

    /// Retry policy for provider request establishment
    pub retry: RetryPolicy,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_concurrent_global: 32,
            max_concurrent_per_session: 0,
            connection_queue_size: 256,
            cancel_grace: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            config_file_path: None,
        }
    }
}

impl StreamConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` when limits are out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_global == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_global must be at least 1".to_string(),
            ));
        }
        if self.connection_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "connection_queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/genstream/genstream.toml` or
/// `~/.config/genstream/genstream.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("genstream").join("genstream.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values fail validation. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<StreamConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting values fail validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StreamConfig, ConfigError> {
    let mut config = StreamConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StreamToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut StreamConfig, toml: &StreamToml) {
    if let Some(max) = toml.limits.max_concurrent_global {
        config.max_concurrent_global = max;
    }
    if let Some(max) = toml.limits.max_concurrent_per_session {
        config.max_concurrent_per_session = max;
    }
    if let Some(size) = toml.limits.connection_queue_size {
        config.connection_queue_size = size;
    }
    if let Some(grace) = toml.cancel.grace_ms {
        config.cancel_grace = Duration::from_millis(grace);
    }
    if let Some(retries) = toml.retry.retries {
        config.retry.retries = retries;
    }
    if let Some(delay) = toml.retry.base_delay_ms {
        config.retry.base_delay = Duration::from_millis(delay);
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut StreamConfig) {
    if let Some(max) = env_parse::<usize>("GENSTREAM_MAX_CONCURRENT_GLOBAL") {
        config.max_concurrent_global = max;
    }
    if let Some(max) = env_parse::<usize>("GENSTREAM_MAX_CONCURRENT_PER_SESSION") {
        config.max_concurrent_per_session = max;
    }
    if let Some(size) = env_parse::<usize>("GENSTREAM_CONNECTION_QUEUE_SIZE") {
        config.connection_queue_size = size;
    }
    if let Some(grace) = env_parse::<u64>("GENSTREAM_CANCEL_GRACE_MS") {
        config.cancel_grace = Duration::from_millis(grace);
    }
    if let Some(retries) = env_parse::<u32>("GENSTREAM_RETRIES") {
        config.retry.retries = retries;
    }
    if let Some(delay) = env_parse::<u64>("GENSTREAM_RETRY_BASE_DELAY_MS") {
        config.retry.base_delay = Duration::from_millis(delay);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!(var = name, value = %value, "ignoring unparseable env override");
                None
            }
        },
        Err(_) => None,
    }
}
