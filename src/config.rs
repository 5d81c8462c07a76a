//! Runtime configuration
//!
//! Every key is optional; missing keys fall back to the defaults below.
//!
//! ```json
//! {
//!   "queue": { "period_ms": 1000, "calls_in_period": 7, "default_ttl": 5 },
//!   "presence": { "timeout_ms": 60000 },
//!   "document": { "event_buffer": 256 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    pub presence: PresenceConfig,
    pub document: DocumentConfig,
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.calls_in_period == 0 {
            return Err(SyncError::InvalidState("queue.calls_in_period must be at least 1".into()));
        }
        if self.document.event_buffer == 0 {
            return Err(SyncError::InvalidState("document.event_buffer must be at least 1".into()));
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidState(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }
}

/// Outbound REST rate limiting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Length of the rolling window.
    pub period_ms: u64,
    /// Requests allowed to start inside one window.
    pub calls_in_period: usize,
    /// Retries granted to a call answered with 429.
    pub default_ttl: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            calls_in_period: 7,
            default_ttl: 5,
        }
    }
}

impl QueueConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Collaborators silent for longer than this are dropped.
    pub timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { timeout_ms: 60_000 }
    }
}

impl PresenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Capacity of each session's event channel. Applied by the transport
    /// that creates the channel (`MemoryBackend::with_event_buffer`); a
    /// document whose receiver falls further behind resyncs from the
    /// session snapshot.
    pub event_buffer: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self { event_buffer: 256 }
    }
}
