//! Runtime configuration.
//!
//! Loaded from a JSON file; any missing field takes its default, and a
//! missing or malformed file falls back to [`CollabConfig::default`].
//!
//! ```json
//! {
//!   "doc_relays": ["ws://localhost:7000"],
//!   "relay": { "publish_timeout_ms": 5000, "ack": "acknowledged" },
//!   "snapshot": { "interval_secs": 300, "kind": "history" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshot::SnapshotKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What counts as a successful publish to a single relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Wait for the relay's `["OK", id, true, ..]`.
    #[default]
    Acknowledged,
    /// A successful socket write is enough.
    Sent,
}

/// Relay connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Fixed delay between reconnect attempts (default: 3000ms)
    pub reconnect_delay_ms: u64,
    /// Per-relay publish timeout (default: 5000ms)
    pub publish_timeout_ms: u64,
    pub ack: AckPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3000,
            publish_timeout_ms: 5000,
            ack: AckPolicy::Acknowledged,
        }
    }
}

impl RelayConfig {
    pub fn for_testing() -> Self {
        Self {
            reconnect_delay_ms: 50,
            publish_timeout_ms: 1000,
            ack: AckPolicy::Acknowledged,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Presence timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// How far back the presence subscription reaches (default: 60s)
    pub lookback_secs: u64,
    /// Announcements older than this are ignored (default: 30s)
    pub freshness_secs: u64,
    /// Local state is re-published this often (default: 15s)
    pub heartbeat_secs: u64,
    /// Stale-entry sweep period (default: 10s)
    pub sweep_secs: u64,
    /// Entries not refreshed for longer than this are evicted (default: 40s)
    pub stale_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            lookback_secs: 60,
            freshness_secs: 30,
            heartbeat_secs: 15,
            sweep_secs: 10,
            stale_secs: 40,
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn sweep(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }
}

/// Snapshot publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Periodic snapshot interval; `None` means on-demand only
    pub interval_secs: Option<u64>,
    pub kind: SnapshotKind,
}

impl SnapshotConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Relays carrying document and presence traffic
    pub doc_relays: Vec<String>,
    /// Public relays queried for profile metadata
    pub profile_relays: Vec<String>,
    pub relay: RelayConfig,
    pub presence: PresenceConfig,
    pub snapshot: SnapshotConfig,
    /// Enables the on-disk document cache when set
    pub storage_path: Option<PathBuf>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            doc_relays: vec!["ws://localhost:7000".to_string()],
            profile_relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
            ],
            relay: RelayConfig::default(),
            presence: PresenceConfig::default(),
            snapshot: SnapshotConfig::default(),
            storage_path: None,
        }
    }
}

impl CollabConfig {
    /// Short timers, no network defaults.
    pub fn for_testing() -> Self {
        Self {
            doc_relays: Vec::new(),
            profile_relays: Vec::new(),
            relay: RelayConfig::for_testing(),
            presence: PresenceConfig {
                heartbeat_secs: 1,
                sweep_secs: 1,
                ..PresenceConfig::default()
            },
            snapshot: SnapshotConfig::default(),
            storage_path: None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path`, logging and falling back to defaults on any failure.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => {
                log::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("{e}; using default config");
                Self::default()
            }
        }
    }
}
