//! Connection Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default server endpoint
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws";

/// Connection manager configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Websocket endpoint
    pub url: String,

    /// How long a connection attempt may take before it fails with a timeout
    pub connect_timeout_ms: u64,

    /// Whether to send keep-alive frames while connected
    pub heartbeat_enabled: bool,

    /// Keep-alive period in seconds
    pub heartbeat_interval_secs: u64,

    /// Backoff floor in milliseconds
    ///
    /// The n-th reconnect attempt waits `base * 2^n`.
    pub reconnect_base_delay_ms: u64,

    /// Reconnect attempts before giving up (0 = never reconnect)
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connect_timeout_ms: 10_000,
            heartbeat_enabled: true,
            heartbeat_interval_secs: 30,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for `url` with default timings
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the backoff floor
    #[must_use]
    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the reconnect attempt cap
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Enable or disable the heartbeat
    #[must_use]
    pub fn with_heartbeat(mut self, enabled: bool) -> Self {
        self.heartbeat_enabled = enabled;
        self
    }

    /// Connect timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Heartbeat period as a `Duration`
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Backoff floor as a `Duration`
    #[must_use]
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}
