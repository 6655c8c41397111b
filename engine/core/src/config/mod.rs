//! TOML Configuration File Support
//!
//! Centralized configuration loading for the engine, from a TOML file at
//! `~/.config/streamsync/engine.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`STREAMSYNC_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [connection]
//! url = "wss://chat.example.com/ws"
//! connect_timeout_ms = 10000
//! heartbeat_interval_secs = 30
//! reconnect_base_delay_ms = 1000
//! max_reconnect_attempts = 5
//!
//! [batching]
//! enabled = true
//! batch_size = 3
//! max_wait_ms = 100
//! frame_interval_ms = 16
//!
//! [session]
//! max_content_chars = 10000
//! retained_chars = 8000
//! max_finished_sessions = 64
//!
//! [reconciler]
//! api_base_url = "https://chat.example.com/api"
//! title_wait_secs = 30
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::ReconcilerConfig;
use crate::session::SessionConfig;
use crate::streaming::BatchingConfig;
use crate::transport::ConnectionConfig;

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
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[connection]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionToml {
    /// Websocket endpoint
    pub url: Option<String>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Whether to send keep-alive frames
    pub heartbeat_enabled: Option<bool>,
    /// Keep-alive period in seconds
    pub heartbeat_interval_secs: Option<u64>,
    /// Backoff floor in milliseconds
    pub reconnect_base_delay_ms: Option<u64>,
    /// Reconnect attempt cap
    pub max_reconnect_attempts: Option<u32>,
}

/// `[batching]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingToml {
    /// Whether tokens are grouped
    pub enabled: Option<bool>,
    /// Tokens per batch
    pub batch_size: Option<usize>,
    /// Max-wait ceiling in milliseconds
    pub max_wait_ms: Option<u64>,
    /// Drain period in milliseconds
    pub frame_interval_ms: Option<u64>,
    /// Pace one-token batches through the processing queue
    pub pace_unbatched: Option<bool>,
}

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Length that triggers trimming
    pub max_content_chars: Option<usize>,
    /// Length kept after trimming
    pub retained_chars: Option<usize>,
    /// Finished sessions kept in memory
    pub max_finished_sessions: Option<usize>,
}

/// `[reconciler]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerToml {
    /// REST base URL
    pub api_base_url: Option<String>,
    /// Bearer token
    pub api_token: Option<String>,
    /// Request timeout in milliseconds
    pub request_timeout_ms: Option<u64>,
    /// Pushed-title wait in seconds
    pub title_wait_secs: Option<u64>,
    /// Duplicate window in milliseconds
    pub dedupe_window_ms: Option<i64>,
    /// Title of new conversations
    pub default_title: Option<String>,
}

/// Root of the TOML file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// `[connection]`
    pub connection: ConnectionToml,
    /// `[batching]`
    pub batching: BatchingToml,
    /// `[session]`
    pub session: SessionToml,
    /// `[reconciler]`
    pub reconciler: ReconcilerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Complete engine configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Connection manager settings
    pub connection: ConnectionConfig,
    /// Batching pacer settings
    pub batching: BatchingConfig,
    /// Session content retention
    pub session: SessionConfig,
    /// Reconciler settings
    pub reconciler: ReconcilerConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            batching: BatchingConfig::default(),
            session: SessionConfig::default(),
            reconciler: ReconcilerConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.retained_chars > self.session.max_content_chars {
            return Err(ConfigError::ValidationError(format!(
                "session.retained_chars ({}) exceeds session.max_content_chars ({})",
                self.session.retained_chars, self.session.max_content_chars
            )));
        }
        if self.connection.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "connection.url must not be empty".to_string(),
            ));
        }
        if self.reconciler.dedupe_window_ms < 0 {
            return Err(ConfigError::ValidationError(
                "reconciler.dedupe_window_ms must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/streamsync/engine.toml`, falling back to
/// `~/.config/streamsync/engine.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("streamsync").join("engine.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing file is not an error.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::default();

    if let Some(config_path) = path {
        match read_config_file(&config_path)? {
            Some(toml_config) => {
                apply_toml_config(&mut config, &toml_config);
                config.source = ConfigSource::File;
                tracing::info!(path = %config_path.display(), "Loaded configuration from file");
                config.config_file_path = Some(config_path);
            }
            None => {
                tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
            }
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Runs before the runtime starts, so a blocking read is fine
fn read_config_file(path: &Path) -> Result<Option<EngineToml>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(toml::from_str(&content)?))
}

/// Apply TOML values
fn apply_toml_config(config: &mut EngineConfig, toml: &EngineToml) {
    let connection = &toml.connection;
    if let Some(url) = &connection.url {
        config.connection.url.clone_from(url);
    }
    if let Some(timeout) = connection.connect_timeout_ms {
        config.connection.connect_timeout_ms = timeout;
    }
    if let Some(enabled) = connection.heartbeat_enabled {
        config.connection.heartbeat_enabled = enabled;
    }
    if let Some(interval) = connection.heartbeat_interval_secs {
        config.connection.heartbeat_interval_secs = interval;
    }
    if let Some(delay) = connection.reconnect_base_delay_ms {
        config.connection.reconnect_base_delay_ms = delay;
    }
    if let Some(attempts) = connection.max_reconnect_attempts {
        config.connection.max_reconnect_attempts = attempts;
    }

    let batching = &toml.batching;
    if let Some(enabled) = batching.enabled {
        config.batching.enabled = enabled;
    }
    if let Some(size) = batching.batch_size {
        config.batching.batch_size = size;
    }
    if let Some(wait) = batching.max_wait_ms {
        config.batching.max_wait_ms = wait;
    }
    if let Some(interval) = batching.frame_interval_ms {
        config.batching.frame_interval_ms = interval;
    }
    if let Some(pace) = batching.pace_unbatched {
        config.batching.pace_unbatched = pace;
    }

    if let Some(max) = toml.session.max_content_chars {
        config.session.max_content_chars = max;
    }
    if let Some(retained) = toml.session.retained_chars {
        config.session.retained_chars = retained;
    }
    if let Some(finished) = toml.session.max_finished_sessions {
        config.session.max_finished_sessions = finished;
    }

    let reconciler = &toml.reconciler;
    if reconciler.api_base_url.is_some() {
        config.reconciler.api_base_url.clone_from(&reconciler.api_base_url);
    }
    if reconciler.api_token.is_some() {
        config.reconciler.api_token.clone_from(&reconciler.api_token);
    }
    if let Some(timeout) = reconciler.request_timeout_ms {
        config.reconciler.request_timeout_ms = timeout;
    }
    if let Some(wait) = reconciler.title_wait_secs {
        config.reconciler.title_wait_secs = wait;
    }
    if let Some(window) = reconciler.dedupe_window_ms {
        config.reconciler.dedupe_window_ms = window;
    }
    if let Some(title) = &reconciler.default_title {
        config.reconciler.default_title.clone_from(title);
    }
}

/// Apply `STREAMSYNC_*` variables
///
/// Unparsable values are ignored with a warning.
fn apply_env_config(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) {
    let mut touched = false;
    let mut parsed = |key: &str| -> Option<String> {
        let value = lookup(key)?;
        touched = true;
        Some(value)
    };

    if let Some(url) = parsed("STREAMSYNC_URL") {
        config.connection.url = url;
    }
    if let Some(v) = parsed("STREAMSYNC_CONNECT_TIMEOUT_MS") {
        set_parsed(&mut config.connection.connect_timeout_ms, "STREAMSYNC_CONNECT_TIMEOUT_MS", &v);
    }
    if let Some(v) = parsed("STREAMSYNC_HEARTBEAT") {
        config.connection.heartbeat_enabled = v != "0" && v.to_lowercase() != "false";
    }
    if let Some(v) = parsed("STREAMSYNC_HEARTBEAT_INTERVAL_SECS") {
        set_parsed(&mut config.connection.heartbeat_interval_secs, "STREAMSYNC_HEARTBEAT_INTERVAL_SECS", &v);
    }
    if let Some(v) = parsed("STREAMSYNC_RECONNECT_BASE_DELAY_MS") {
        set_parsed(&mut config.connection.reconnect_base_delay_ms, "STREAMSYNC_RECONNECT_BASE_DELAY_MS", &v);
    }
    if let Some(v) = parsed("STREAMSYNC_MAX_RECONNECT_ATTEMPTS") {
        set_parsed(&mut config.connection.max_reconnect_attempts, "STREAMSYNC_MAX_RECONNECT_ATTEMPTS", &v);
    }
    if let Some(v) = parsed("STREAMSYNC_BATCHING") {
        config.batching.enabled = v != "0" && v.to_lowercase() != "false";
    }
    if let Some(v) = parsed("STREAMSYNC_BATCH_SIZE") {
        set_parsed(&mut config.batching.batch_size, "STREAMSYNC_BATCH_SIZE", &v);
    }
    if let Some(url) = parsed("STREAMSYNC_API_URL") {
        config.reconciler.api_base_url = Some(url);
    }
    if let Some(token) = parsed("STREAMSYNC_API_TOKEN") {
        config.reconciler.api_token = Some(token);
    }
    if let Some(v) = parsed("STREAMSYNC_TITLE_WAIT_SECS") {
        set_parsed(&mut config.reconciler.title_wait_secs, "STREAMSYNC_TITLE_WAIT_SECS", &v);
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(key, value, "Ignoring unparsable environment variable"),
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Websocket endpoint override
    pub url: Option<String>,
    /// REST base URL override
    pub api_base_url: Option<String>,
    /// Heartbeat enabled override
    pub heartbeat_enabled: Option<bool>,
    /// Batch size override
    pub batch_size: Option<usize>,
    /// Batching enabled override
    pub batching_enabled: Option<bool>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the websocket endpoint
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the REST base URL
    #[must_use]
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Enable or disable the heartbeat
    #[must_use]
    pub fn with_heartbeat_enabled(mut self, enabled: bool) -> Self {
        self.heartbeat_enabled = Some(enabled);
        self
    }

    /// Set the batch size
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Enable or disable batching
    #[must_use]
    pub fn with_batching_enabled(mut self, enabled: bool) -> Self {
        self.batching_enabled = Some(enabled);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.api_base_url.is_none()
            && self.heartbeat_enabled.is_none()
            && self.batch_size.is_none()
            && self.batching_enabled.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut EngineConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(url) = &self.url {
            config.connection.url.clone_from(url);
        }
        if self.api_base_url.is_some() {
            config.reconciler.api_base_url.clone_from(&self.api_base_url);
        }
        if let Some(enabled) = self.heartbeat_enabled {
            config.connection.heartbeat_enabled = enabled;
        }
        if let Some(size) = self.batch_size {
            config.batching.batch_size = size;
        }
        if let Some(enabled) = self.batching_enabled {
            config.batching.enabled = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
