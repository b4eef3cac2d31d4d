/// Sync session configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CollaborationError, EngineConfig, Result};

/// Settings for one collaboration session
///
/// Every field has a default, so a config file only needs the keys it
/// wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub engine: EngineConfig,

    /// Recently seen message ids remembered for duplicate suppression
    pub dedup_capacity: usize,

    /// Pending-operation sweep and outbox flush period
    pub sweep_interval_ms: u64,

    /// History cleanup and expiry period
    pub cleanup_interval_ms: u64,

    pub notification_ttl_ms: u64,

    pub max_notifications: usize,

    /// Peers silent for longer than this are dropped from the roster
    pub peer_idle_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            dedup_capacity: 1_000,
            sweep_interval_ms: 1_000,
            cleanup_interval_ms: 60_000,
            notification_ttl_ms: 300_000,
            max_notifications: 50,
            peer_idle_ms: 60_000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CollaborationError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| CollaborationError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the session loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 || self.cleanup_interval_ms == 0 {
            return Err(CollaborationError::Config(
                "sweep and cleanup intervals must be non-zero".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(CollaborationError::Config(
                "dedup_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn notification_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.notification_ttl_ms as i64)
    }

    pub fn peer_idle(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.peer_idle_ms as i64)
    }
}
