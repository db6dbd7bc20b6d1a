//! Durable conflict records, used by the manual resolution strategy and as
//! an audit trail for automatic resolutions.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::types::{ConflictRecord, ConflictState, SyncMessage};

use super::{parse_ts, ts, Db};

pub struct ConflictStore {
    db: Arc<Db>,
}

impl ConflictStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Record a conflict. `resolution = None` leaves it open (manual
    /// strategy); a value records an already-settled automatic resolution.
    pub fn record(
        &self,
        msg: &SyncMessage,
        local_snapshot: Option<&Value>,
        resolution: Option<&str>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let state = if resolution.is_some() { "resolved" } else { "open" };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conflicts
                     (id, message_id, content_type, document_id,
                      local_snapshot, remote_snapshot, detected_at, state, resolution)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    msg.message_id,
                    msg.content_type,
                    msg.document_id,
                    local_snapshot.map(|v| v.to_string()),
                    msg.payload.as_ref().map(|v| v.to_string()),
                    ts(Utc::now()),
                    state,
                    resolution,
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, message_id, content_type, document_id,
                        local_snapshot, remote_snapshot, detected_at, state, resolution
                   FROM conflicts WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()
            .map_err(SyncError::from)
        })
    }

    pub fn list(&self, state: Option<ConflictState>) -> Result<Vec<ConflictRecord>> {
        let filter = state.map(|s| match s {
            ConflictState::Open => "open",
            ConflictState::Resolved => "resolved",
        });
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, content_type, document_id,
                        local_snapshot, remote_snapshot, detected_at, state, resolution
                   FROM conflicts
                  WHERE (?1 IS NULL OR state = ?1)
                  ORDER BY detected_at, id",
            )?;
            let records = stmt
                .query_map(params![filter], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Close an open conflict. Returns `false` if it was already resolved
    /// or does not exist.
    pub fn mark_resolved(&self, id: &str, resolution: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE conflicts SET state = 'resolved', resolution = ?2
                  WHERE id = ?1 AND state = 'open'",
                params![id, resolution],
            )?;
            Ok(n > 0)
        })
    }

    pub fn open_count(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM conflicts WHERE state = 'open'",
                [],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    let local: Option<String> = row.get(4)?;
    let remote: Option<String> = row.get(5)?;
    let detected: String = row.get(6)?;
    let state: String = row.get(7)?;
    Ok(ConflictRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        content_type: row.get(2)?,
        document_id: row.get(3)?,
        local_snapshot: local.and_then(|s| serde_json::from_str(&s).ok()),
        remote_snapshot: remote.and_then(|s| serde_json::from_str(&s).ok()),
        detected_at: parse_ts(&detected).unwrap_or_else(|_| Utc::now()),
        state: if state == "open" {
            ConflictState::Open
        } else {
            ConflictState::Resolved
        },
        resolution: row.get(8)?,
    })
}
