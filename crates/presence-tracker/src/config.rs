//! Tracker configuration.
//!
//! Timing parameters have no defaults: every deployment chooses its own
//! heartbeat cadence, failure thresholds and tombstone retention. Only the
//! delta batching window and the send retry policy fall back to defaults.
//!
//! ```toml
//! node = "node-a"
//! heartbeat_interval_ms = 1000
//! suspect_timeout_ms = 3000
//! down_timeout_ms = 10000
//! tombstone_grace_ms = 60000
//! # optional
//! broadcast_period_ms = 50
//! max_send_attempts = 3
//! retry_backoff_ms = 100
//! ```

use crate::clock::NodeId;
use crate::error::{Result, TrackerError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_broadcast_period_ms() -> u64 {
    50
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

/// On-disk shape of [`TrackerConfig`], durations in milliseconds.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    node: String,
    heartbeat_interval_ms: u64,
    suspect_timeout_ms: u64,
    down_timeout_ms: u64,
    tombstone_grace_ms: u64,
    #[serde(default = "default_broadcast_period_ms")]
    broadcast_period_ms: u64,
    #[serde(default = "default_max_send_attempts")]
    max_send_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    retry_backoff_ms: u64,
}

/// Configuration for one tracker node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawConfig")]
pub struct TrackerConfig {
    /// This node's id. Must be unique per running instance.
    pub node: NodeId,
    /// How often heartbeats are sent.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer becomes `Suspect`.
    pub suspect_timeout: Duration,
    /// Silence after which a peer is declared `Down` and purged.
    pub down_timeout: Duration,
    /// Minimum age of a tombstone before it may be collected.
    pub tombstone_grace: Duration,
    /// Window over which local deltas are batched before broadcast.
    pub broadcast_period: Duration,
    /// Attempts per outbound message before the peer is marked `Suspect`.
    pub max_send_attempts: u32,
    /// Pause between send attempts.
    pub retry_backoff: Duration,
}

impl TrackerConfig {
    /// Create a configuration from the required parameters.
    pub fn new(
        node: impl Into<NodeId>,
        heartbeat_interval: Duration,
        suspect_timeout: Duration,
        down_timeout: Duration,
        tombstone_grace: Duration,
    ) -> Self {
        Self {
            node: node.into(),
            heartbeat_interval,
            suspect_timeout,
            down_timeout,
            tombstone_grace,
            broadcast_period: Duration::from_millis(default_broadcast_period_ms()),
            max_send_attempts: default_max_send_attempts(),
            retry_backoff: Duration::from_millis(default_retry_backoff_ms()),
        }
    }

    /// Set the delta batching window.
    pub fn with_broadcast_period(mut self, period: Duration) -> Self {
        self.broadcast_period = period;
        self
    }

    /// Set the outbound retry policy.
    pub fn with_retry(mut self, max_send_attempts: u32, backoff: Duration) -> Self {
        self.max_send_attempts = max_send_attempts;
        self.retry_backoff = backoff;
        self
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| TrackerError::InvalidConfig(e.to_string()))
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrackerError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check the timing relationships the failure detector relies on.
    pub fn validate(&self) -> Result<()> {
        if self.node.as_str().is_empty() {
            return Err(TrackerError::InvalidConfig("node id is required".into()));
        }

        let nonzero = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("suspect_timeout", self.suspect_timeout),
            ("down_timeout", self.down_timeout),
            ("tombstone_grace", self.tombstone_grace),
            ("broadcast_period", self.broadcast_period),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(TrackerError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.heartbeat_interval >= self.suspect_timeout {
            return Err(TrackerError::InvalidConfig(
                "heartbeat_interval must be shorter than suspect_timeout".into(),
            ));
        }
        if self.suspect_timeout >= self.down_timeout {
            return Err(TrackerError::InvalidConfig(
                "suspect_timeout must be shorter than down_timeout".into(),
            ));
        }
        if self.max_send_attempts == 0 {
            return Err(TrackerError::InvalidConfig(
                "max_send_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

impl TryFrom<RawConfig> for TrackerConfig {
    type Error = TrackerError;

    fn try_from(raw: RawConfig) -> Result<Self> {
        let config = Self {
            node: NodeId::new(raw.node),
            heartbeat_interval: Duration::from_millis(raw.heartbeat_interval_ms),
            suspect_timeout: Duration::from_millis(raw.suspect_timeout_ms),
            down_timeout: Duration::from_millis(raw.down_timeout_ms),
            tombstone_grace: Duration::from_millis(raw.tombstone_grace_ms),
            broadcast_period: Duration::from_millis(raw.broadcast_period_ms),
            max_send_attempts: raw.max_send_attempts,
            retry_backoff: Duration::from_millis(raw.retry_backoff_ms),
        };
        config.validate()?;
        Ok(config)
    }
}
