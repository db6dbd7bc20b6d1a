//! Processed-message ledger (exactly-once effect).
//!
//! The unique key on `message_id` is what collapses duplicate deliveries:
//! `mark_processed` reports whether this call was the first.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::types::{ProcessedMessage, ProcessedStatus, SyncMessage};

use super::{parse_ts, ts, Db};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub processed: u64,
    pub failed: u64,
}

pub struct MessageTracker {
    db: Arc<Db>,
}

impl MessageTracker {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Whether `message_id` has already been applied successfully. A `failed`
    /// entry does not count: failed messages may be replayed.
    pub fn is_processed(&self, message_id: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let hit: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM processed_messages WHERE message_id = ?1 AND status = 'processed'",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(hit.is_some())
        })
    }

    /// Record a successful apply. Returns `true` on first insertion, `false`
    /// when the message was already processed. A prior `failed` entry is
    /// promoted; the reverse transition never happens.
    pub fn mark_processed(&self, msg: &SyncMessage) -> Result<bool> {
        self.mark(msg, ProcessedStatus::Processed)
    }

    /// Record a terminal apply failure, unless the message already succeeded.
    pub fn mark_failed(&self, msg: &SyncMessage) -> Result<bool> {
        self.mark(msg, ProcessedStatus::Failed)
    }

    fn mark(&self, msg: &SyncMessage, status: ProcessedStatus) -> Result<bool> {
        let now = ts(Utc::now());
        self.db.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO processed_messages
                     (message_id, ship_id, content_type, document_id, operation, status, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    msg.message_id,
                    msg.ship_id,
                    msg.content_type,
                    msg.document_id,
                    msg.operation.as_str(),
                    status.as_str(),
                    now,
                ],
            )?;
            if inserted > 0 {
                return Ok(true);
            }
            // Duplicate id: only the failed → processed promotion is allowed.
            if status == ProcessedStatus::Processed {
                let promoted = tx.execute(
                    "UPDATE processed_messages
                        SET status = 'processed', processed_at = ?2
                      WHERE message_id = ?1 AND status = 'failed'",
                    params![msg.message_id, now],
                )?;
                if promoted > 0 {
                    debug!(message_id = %msg.message_id, "promoted failed message to processed");
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Record a message id that was coalesced away by the debounce window.
    /// If the superseded message later arrives out of order, the dedup check
    /// short-circuits it. Never demotes an existing entry.
    pub fn mark_superseded(&self, survivor: &SyncMessage, superseded_id: &str) -> Result<bool> {
        let now = ts(Utc::now());
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO processed_messages
                     (message_id, ship_id, content_type, document_id, operation, status, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'processed', ?6)",
                params![
                    superseded_id,
                    survivor.ship_id,
                    survivor.content_type,
                    survivor.document_id,
                    survivor.operation.as_str(),
                    now,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn get(&self, message_id: &str) -> Result<Option<ProcessedMessage>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT message_id, ship_id, content_type, document_id, operation, status, processed_at
                   FROM processed_messages WHERE message_id = ?1",
                params![message_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?
            .map(|(message_id, ship_id, content_type, document_id, op, status, processed_at)| {
                Ok(ProcessedMessage {
                    message_id,
                    ship_id,
                    content_type,
                    document_id,
                    operation: crate::types::Operation::parse(&op)
                        .ok_or_else(|| SyncError::Storage(format!("bad operation {op:?}")))?,
                    status: if status == "processed" {
                        ProcessedStatus::Processed
                    } else {
                        ProcessedStatus::Failed
                    },
                    processed_at: parse_ts(&processed_at)?,
                })
            })
            .transpose()
        })
    }

    /// Delete entries older than the retention cutoff. No-ops (returning 0)
    /// while the database is shutting down.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        if self.db.is_shutting_down() {
            return Ok(0);
        }
        let cutoff = ts(Utc::now() - Duration::days(i64::from(retention_days)));
        let removed = self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM processed_messages WHERE processed_at < ?1",
                params![cutoff],
            )?;
            Ok(n)
        });
        match removed {
            Ok(n) => {
                if n > 0 {
                    debug!(removed = n, "pruned processed-message ledger");
                }
                Ok(n)
            }
            Err(SyncError::Shutdown) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn stats(&self) -> Result<TrackerStats> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM processed_messages GROUP BY status")?;
            let mut stats = TrackerStats::default();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status.as_str() {
                    "processed" => stats.processed = count,
                    "failed" => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }
}
