//! Conflict detection and resolution.
//!
//! Detection compares the local record version against the version the
//! remote writer observed. Resolution is a pure function of the two
//! snapshots and the configured strategy — no clock reads, no I/O — so the
//! same inputs always settle the same way on every site.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::types::{Role, SyncMessage, WriterRank};

// ============================================================================
// Strategy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    LastWriteWins,
    MasterWins,
    Manual,
    Merge,
}

impl ConflictStrategy {
    pub fn parse(s: &str) -> Option<ConflictStrategy> {
        match s {
            "last-write-wins" => Some(ConflictStrategy::LastWriteWins),
            "master-wins" => Some(ConflictStrategy::MasterWins),
            "manual" => Some(ConflictStrategy::Manual),
            "merge" => Some(ConflictStrategy::Merge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::MasterWins => "master-wins",
            ConflictStrategy::Manual => "manual",
            ConflictStrategy::Merge => "merge",
        }
    }
}

/// Per content type strategy selection with a global default.
#[derive(Debug, Clone)]
pub struct StrategyMap {
    default: ConflictStrategy,
    overrides: BTreeMap<String, ConflictStrategy>,
}

impl Default for StrategyMap {
    fn default() -> Self {
        Self {
            default: ConflictStrategy::LastWriteWins,
            overrides: BTreeMap::new(),
        }
    }
}

impl StrategyMap {
    /// Build from the config's `contentType → strategy name` table. Unknown
    /// names were already rejected by config validation.
    pub fn from_config(overrides: &BTreeMap<String, String>) -> Self {
        Self {
            default: ConflictStrategy::LastWriteWins,
            overrides: overrides
                .iter()
                .filter_map(|(k, v)| ConflictStrategy::parse(v).map(|s| (k.clone(), s)))
                .collect(),
        }
    }

    pub fn for_content_type(&self, content_type: &str) -> ConflictStrategy {
        self.overrides
            .get(content_type)
            .copied()
            .unwrap_or(self.default)
    }
}

// ============================================================================
// Detection
// ============================================================================

/// The local side of a potential conflict, read under the document lock.
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    pub version: u64,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// A write-write conflict exists when the local record moved past the
/// version the remote writer based its change on.
pub fn is_conflict(local_version: u64, base_version: u64) -> bool {
    local_version > base_version
}

// ============================================================================
// Resolution
// ============================================================================

/// How a detected conflict settles.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Remote change wins; apply it.
    ApplyRemote { reason: &'static str },
    /// Local state wins; the remote message is recorded and dropped.
    KeepLocal { reason: &'static str },
    /// Field-wise (or whole-document) merge result to apply.
    Merged {
        payload: Value,
        reason: &'static str,
    },
    /// Remote message is parked for operator attention.
    ParkRemote { reason: &'static str },
    /// Apply pauses until an operator resolves the persisted record.
    Manual,
}

impl Resolution {
    pub fn reason(&self) -> &'static str {
        match self {
            Resolution::ApplyRemote { reason } => reason,
            Resolution::KeepLocal { reason } => reason,
            Resolution::Merged { reason, .. } => reason,
            Resolution::ParkRemote { reason } => reason,
            Resolution::Manual => "manual",
        }
    }
}

/// Resolve a conflict between `local` and the inbound `msg`.
///
/// `self_role` identifies this site: it ranks the local writer for
/// last-write-wins ties (master outranks every ship) and orients
/// master-wins (the master parks replica messages; replicas yield to
/// master messages).
pub fn resolve(
    local: &LocalSnapshot,
    msg: &SyncMessage,
    strategy: ConflictStrategy,
    self_role: Role,
    self_ship_id: Option<&str>,
) -> Resolution {
    match strategy {
        ConflictStrategy::LastWriteWins => resolve_lww(local, msg, self_role, self_ship_id),
        ConflictStrategy::MasterWins => match msg.ship_id {
            // Master-originated changes prevail everywhere.
            None => Resolution::ApplyRemote {
                reason: "master-wins",
            },
            Some(_) => Resolution::ParkRemote {
                reason: "master-wins",
            },
        },
        ConflictStrategy::Manual => Resolution::Manual,
        ConflictStrategy::Merge => resolve_merge(local, msg),
    }
}

fn resolve_lww(
    local: &LocalSnapshot,
    msg: &SyncMessage,
    self_role: Role,
    self_ship_id: Option<&str>,
) -> Resolution {
    if msg.occurred_at > local.updated_at {
        return Resolution::ApplyRemote { reason: "newer" };
    }
    if msg.occurred_at < local.updated_at {
        return Resolution::KeepLocal { reason: "older" };
    }
    // Identical timestamps: break deterministically by writer rank.
    let local_rank = match self_role {
        Role::Master => WriterRank::Master,
        Role::Replica => WriterRank::Ship(self_ship_id.unwrap_or("")),
    };
    if msg.writer_rank() > local_rank {
        Resolution::ApplyRemote { reason: "tie" }
    } else {
        Resolution::KeepLocal { reason: "tie" }
    }
}

const FIELD_TIMESTAMPS: &str = "_field_timestamps";

fn resolve_merge(local: &LocalSnapshot, msg: &SyncMessage) -> Resolution {
    let remote_payload = match &msg.payload {
        Some(p) => p,
        // Delete vs update: without a payload there is nothing to merge.
        None => {
            return if msg.occurred_at >= local.updated_at {
                Resolution::ApplyRemote {
                    reason: "merged-lww",
                }
            } else {
                Resolution::KeepLocal {
                    reason: "merged-lww",
                }
            }
        }
    };

    match (
        field_timestamps(&local.payload),
        field_timestamps(remote_payload),
    ) {
        (Some(local_ts), Some(remote_ts)) => {
            let payload = merge_by_field(
                &local.payload,
                remote_payload,
                &local_ts,
                &remote_ts,
                local.updated_at,
                msg.occurred_at,
            );
            Resolution::Merged {
                payload,
                reason: "merged-fields",
            }
        }
        // Without per-field timestamps the whole newer document wins.
        _ => {
            if msg.occurred_at >= local.updated_at {
                Resolution::Merged {
                    payload: remote_payload.clone(),
                    reason: "merged-lww",
                }
            } else {
                Resolution::Merged {
                    payload: local.payload.clone(),
                    reason: "merged-lww",
                }
            }
        }
    }
}

fn field_timestamps(payload: &Value) -> Option<BTreeMap<String, DateTime<Utc>>> {
    let map = payload.get(FIELD_TIMESTAMPS)?.as_object()?;
    let mut out = BTreeMap::new();
    for (field, raw) in map {
        let ts = raw.as_str()?;
        let parsed = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
        out.insert(field.clone(), parsed);
    }
    Some(out)
}

fn merge_by_field(
    local: &Value,
    remote: &Value,
    local_ts: &BTreeMap<String, DateTime<Utc>>,
    remote_ts: &BTreeMap<String, DateTime<Utc>>,
    local_default: DateTime<Utc>,
    remote_default: DateTime<Utc>,
) -> Value {
    let empty = Map::new();
    let local_obj = local.as_object().unwrap_or(&empty);
    let remote_obj = remote.as_object().unwrap_or(&empty);

    let mut merged = Map::new();
    let mut merged_ts = Map::new();

    let mut fields: Vec<&String> = local_obj.keys().chain(remote_obj.keys()).collect();
    fields.sort();
    fields.dedup();

    for field in fields {
        if field == FIELD_TIMESTAMPS {
            continue;
        }
        let lt = local_ts.get(field).copied().unwrap_or(local_default);
        let rt = remote_ts.get(field).copied().unwrap_or(remote_default);
        let (value, ts) = match (local_obj.get(field), remote_obj.get(field)) {
            (Some(lv), Some(rv)) => {
                if rt >= lt {
                    (rv.clone(), rt)
                } else {
                    (lv.clone(), lt)
                }
            }
            (Some(lv), None) => (lv.clone(), lt),
            (None, Some(rv)) => (rv.clone(), rt),
            (None, None) => continue,
        };
        merged_ts.insert(
            field.clone(),
            Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)),
        );
        merged.insert(field.clone(), value);
    }
    merged.insert(FIELD_TIMESTAMPS.to_string(), Value::Object(merged_ts));
    Value::Object(merged)
}
