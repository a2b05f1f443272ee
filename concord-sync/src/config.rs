//! Engine tuning knobs.
//!
//! `SyncConfig` deserializes with defaults for every missing field, so the
//! `opts` object of a document's doctype can override any of them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts and snapshot policy for tables and documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Timeout attached to changefeed queries.
    pub feed_timeout_ms: u64,
    /// How long a local write waits for its acknowledgement.
    pub write_timeout_ms: u64,
    /// Patches between two snapshots.
    pub snapshot_interval: usize,
    /// Upper bound for the init flow of a document, 0 for none.
    pub init_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            feed_timeout_ms: 30_000,
            write_timeout_ms: 15_000,
            snapshot_interval: 300,
            init_timeout_ms: 0,
        }
    }
}

impl SyncConfig {
    /// Short timeouts and frequent snapshots.
    pub fn for_testing() -> Self {
        Self {
            feed_timeout_ms: 2_000,
            write_timeout_ms: 2_000,
            snapshot_interval: 5,
            init_timeout_ms: 5_000,
        }
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn init_timeout(&self) -> Option<Duration> {
        (self.init_timeout_ms > 0).then(|| Duration::from_millis(self.init_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_overrides_keep_defaults() {
        let config: SyncConfig = serde_json::from_value(json!({"snapshot_interval": 10})).unwrap();
        assert_eq!(config.snapshot_interval, 10);
        assert_eq!(config.write_timeout_ms, SyncConfig::default().write_timeout_ms);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let config: SyncConfig =
            serde_json::from_value(json!({"primary_keys": ["id"], "feed_timeout_ms": 5})).unwrap();
        assert_eq!(config.feed_timeout(), Duration::from_millis(5));
    }

    #[test]
    fn test_init_timeout_zero_means_none() {
        assert_eq!(SyncConfig::default().init_timeout(), None);
        assert!(SyncConfig::for_testing().init_timeout().is_some());
    }
}
