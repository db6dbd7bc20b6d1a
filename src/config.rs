//! Engine configuration, deserialized from the host's JSON config tree.
//!
//! Defaults mirror a small shore-side deployment; `validate()` fails fast on
//! contradictions so a misconfigured process never reaches the bus.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::types::Role;

// ============================================================================
// Bus / topics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaslConfig {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// Comma-separated broker endpoints.
    pub brokers: String,
    pub ssl: bool,
    pub sasl: Option<SaslConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            ssl: false,
            sasl: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicsConfig {
    /// Replica → master.
    pub ship_updates: String,
    /// Master → fan-out.
    pub master_updates: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            ship_updates: "ship-updates".to_string(),
            master_updates: "master-updates".to_string(),
        }
    }
}

// ============================================================================
// Sync tuning
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncTuning {
    /// Entries claimed per push iteration.
    pub batch_size: usize,
    /// Failures tolerated before a message is parked.
    pub retry_attempts: u32,
    /// Base backoff in milliseconds.
    #[serde(alias = "retryDelay")]
    pub retry_delay_ms: u64,
    /// Link probe cadence in milliseconds.
    #[serde(alias = "connectivityCheckInterval")]
    pub connectivity_check_interval_ms: u64,
    /// Coalesce window for repeated writes to the same document.
    pub debounce_ms: u64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry_attempts: 3,
            retry_delay_ms: 5_000,
            connectivity_check_interval_ms: 30_000,
            debounce_ms: 1_000,
        }
    }
}

// ============================================================================
// Media mirror
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaConfig {
    /// Whether the mirror loop runs at all.
    pub enabled: bool,
    /// Local cache directory.
    pub cache_dir: PathBuf,
    /// Mirror cadence in milliseconds.
    pub interval_ms: u64,
    /// In-flight transfer cap.
    pub concurrency: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_dir: PathBuf::from(".shipsync/media"),
            interval_ms: 300_000,
            concurrency: 8,
        }
    }
}

// ============================================================================
// SyncConfig
// ============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub mode: Role,
    /// Required when `mode = replica`; must be absent on the master.
    pub ship_id: Option<String>,
    /// Human-readable name reported to the ship registry.
    pub ship_name: Option<String>,
    pub bus: BusConfig,
    pub topics: TopicsConfig,
    pub sync: SyncTuning,
    /// Content types subscribed to replication. Empty means nothing is
    /// captured, which is a valid (dormant) configuration.
    pub content_types: Vec<String>,
    /// Per content type conflict strategy overrides; the default strategy is
    /// last-write-wins.
    pub conflict_strategies: BTreeMap<String, String>,
    pub media: MediaConfig,
    /// Processed-message retention, in days.
    pub retention_days: u32,
    /// A ship flips offline when unseen for twice this long.
    pub heartbeat_interval_ms: u64,
    /// Path of the engine's sqlite database. `None` keeps state in memory
    /// (tests and dry runs only — queued messages do not survive restart).
    pub database_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: Role::Replica,
            ship_id: None,
            ship_name: None,
            bus: BusConfig::default(),
            topics: TopicsConfig::default(),
            sync: SyncTuning::default(),
            content_types: Vec::new(),
            conflict_strategies: BTreeMap::new(),
            media: MediaConfig::default(),
            retention_days: 7,
            heartbeat_interval_ms: 30_000,
            database_path: None,
        }
    }
}

impl SyncConfig {
    /// Fail-fast validation run once at startup.
    pub fn validate(&self) -> Result<()> {
        match (self.mode, &self.ship_id) {
            (Role::Replica, None) => {
                return Err(SyncError::Config(
                    "mode=replica requires a shipId".to_string(),
                ))
            }
            (Role::Master, Some(id)) => {
                return Err(SyncError::Config(format!(
                    "mode=master must not set a shipId (got {id:?})"
                )))
            }
            _ => {}
        }
        if let Some(id) = &self.ship_id {
            if id.is_empty() {
                return Err(SyncError::Config("shipId must not be empty".to_string()));
            }
        }
        if self.sync.batch_size == 0 {
            return Err(SyncError::Config("sync.batchSize must be >= 1".to_string()));
        }
        if self.sync.debounce_ms >= self.sync.retry_delay_ms {
            return Err(SyncError::Config(format!(
                "sync.debounceMs ({}) must be below sync.retryDelay ({})",
                self.sync.debounce_ms, self.sync.retry_delay_ms
            )));
        }
        if self.bus.brokers.trim().is_empty() {
            return Err(SyncError::Config("bus.brokers must not be empty".to_string()));
        }
        if self.topics.ship_updates == self.topics.master_updates {
            return Err(SyncError::Config(
                "topics.shipUpdates and topics.masterUpdates must differ".to_string(),
            ));
        }
        for (content_type, strategy) in &self.conflict_strategies {
            if crate::sync::conflict::ConflictStrategy::parse(strategy).is_none() {
                return Err(SyncError::Config(format!(
                    "unknown conflict strategy {strategy:?} for {content_type}"
                )));
            }
        }
        if self.media.enabled && self.media.concurrency == 0 {
            return Err(SyncError::Config(
                "media.concurrency must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.sync.debounce_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.sync.retry_delay_ms)
    }

    pub fn connectivity_check_interval(&self) -> Duration {
        Duration::from_millis(self.sync.connectivity_check_interval_ms)
    }

    /// Staleness cutoff for the ship registry: `2 × heartbeatInterval`.
    pub fn ship_stale_after(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_mul(2))
    }

    /// Outbound topic for this role.
    pub fn outbound_topic(&self) -> &str {
        match self.mode {
            Role::Master => &self.topics.master_updates,
            Role::Replica => &self.topics.ship_updates,
        }
    }

    /// Ship identity, present exactly when this is a replica.
    pub fn ship_id(&self) -> Option<&str> {
        self.ship_id.as_deref()
    }
}
