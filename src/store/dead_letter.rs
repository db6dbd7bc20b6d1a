//! Dead-letter store: the terminal parking lot for messages that could not
//! be applied. Upstream never drops a message; entries are parked here and
//! only an operator (or a later successful retry) moves them on. Nothing is
//! auto-deleted.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::types::{DeadLetterEntry, DeadLetterState, SyncMessage};

use super::{parse_ts, ts, Db};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadLetterStats {
    pub pending: u64,
    pub retrying: u64,
    pub exhausted: u64,
    pub resolved: u64,
}

impl DeadLetterStats {
    pub fn total(&self) -> u64 {
        self.pending + self.retrying + self.exhausted + self.resolved
    }
}

pub struct DeadLetterStore {
    db: Arc<Db>,
}

impl DeadLetterStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Park a message. Messages that exhausted their retry budget (or were
    /// unprocessable outright: orphans, serialization failures) land in
    /// `exhausted`; anything parked for operator review lands in `pending`.
    /// Re-parking the same message id bumps `attempts` and `last_seen_at`.
    pub fn park(&self, msg: &SyncMessage, reason: &str, error: Option<&str>) -> Result<i64> {
        let state = match reason {
            "conflict" => DeadLetterState::Pending,
            _ => DeadLetterState::Exhausted,
        };
        self.park_with_state(msg, reason, error, state)
    }

    pub fn park_with_state(
        &self,
        msg: &SyncMessage,
        reason: &str,
        error: Option<&str>,
        state: DeadLetterState,
    ) -> Result<i64> {
        let now = ts(Utc::now());
        let body = serde_json::to_string(msg)?;
        warn!(
            message_id = %msg.message_id,
            content_type = %msg.content_type,
            document_id = %msg.document_id,
            reason,
            "parking message in dead-letter store"
        );
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO dead_letter
                     (message_id, message, reason, state, attempts, last_error, first_seen_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT (message_id) DO UPDATE SET
                     attempts = attempts + 1,
                     last_error = excluded.last_error,
                     state = excluded.state,
                     last_seen_at = excluded.last_seen_at",
                params![
                    msg.message_id,
                    body,
                    reason,
                    state.as_str(),
                    msg.attempt,
                    error,
                    now,
                ],
            )?;
            let id = tx.query_row(
                "SELECT id FROM dead_letter WHERE message_id = ?1",
                params![msg.message_id],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<DeadLetterEntry>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, message, reason, state, attempts, last_error, first_seen_at, last_seen_at
                   FROM dead_letter WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()
            .map_err(SyncError::from)
        })
    }

    /// List entries, optionally restricted to one state, oldest first.
    pub fn list(&self, state: Option<DeadLetterState>) -> Result<Vec<DeadLetterEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message, reason, state, attempts, last_error, first_seen_at, last_seen_at
                   FROM dead_letter
                  WHERE (?1 IS NULL OR state = ?1)
                  ORDER BY first_seen_at, id",
            )?;
            let entries = stmt
                .query_map(params![state.map(|s| s.as_str())], row_to_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Hand a parked message back for another delivery attempt. The entry
    /// moves to `retrying`; the caller re-runs the apply (or re-enqueues)
    /// and settles it with [`mark_retry_outcome`](Self::mark_retry_outcome).
    pub fn begin_retry(&self, id: i64) -> Result<Option<SyncMessage>> {
        self.db.with_tx(|tx| {
            let entry: Option<(String, String)> = tx
                .query_row(
                    "SELECT message, state FROM dead_letter WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((body, state)) = entry else {
                return Ok(None);
            };
            if state == "resolved" {
                return Ok(None);
            }
            tx.execute(
                "UPDATE dead_letter SET state = 'retrying', last_seen_at = ?2 WHERE id = ?1",
                params![id, ts(Utc::now())],
            )?;
            let msg: SyncMessage = serde_json::from_str(&body)?;
            Ok(Some(msg))
        })
    }

    /// Settle a retry started with [`begin_retry`](Self::begin_retry).
    pub fn mark_retry_outcome(&self, id: i64, succeeded: bool, error: Option<&str>) -> Result<()> {
        let state = if succeeded {
            DeadLetterState::Resolved
        } else {
            DeadLetterState::Exhausted
        };
        if succeeded {
            info!(dead_letter_id = id, "dead-letter retry succeeded");
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE dead_letter
                    SET state = ?2, attempts = attempts + 1, last_error = ?3, last_seen_at = ?4
                  WHERE id = ?1",
                params![id, state.as_str(), error, ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// Operator resolution without a retry (e.g. "discard", "rebound").
    pub fn resolve(&self, id: i64, action: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE dead_letter
                    SET state = 'resolved', last_error = ?2, last_seen_at = ?3
                  WHERE id = ?1 AND state != 'resolved'",
                params![id, action, ts(Utc::now())],
            )?;
            Ok(n > 0)
        })
    }

    pub fn stats(&self) -> Result<DeadLetterStats> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM dead_letter GROUP BY state")?;
            let mut stats = DeadLetterStats::default();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                match state.as_str() {
                    "pending" => stats.pending = count,
                    "retrying" => stats.retrying = count,
                    "exhausted" => stats.exhausted = count,
                    "resolved" => stats.resolved = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<DeadLetterEntry> {
    let body: String = row.get(1)?;
    let state: String = row.get(3)?;
    let first_seen: String = row.get(6)?;
    let last_seen: String = row.get(7)?;
    Ok(DeadLetterEntry {
        id: row.get(0)?,
        message: serde_json::from_str(&body).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        reason: row.get(2)?,
        state: DeadLetterState::parse(&state).unwrap_or(DeadLetterState::Exhausted),
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        first_seen_at: parse_ts(&first_seen).unwrap_or_else(|_| Utc::now()),
        last_seen_at: parse_ts(&last_seen).unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;
    use serde_json::json;

    fn store() -> DeadLetterStore {
        DeadLetterStore::new(Db::open_in_memory().expect("open"))
    }

    fn msg(id: &str) -> SyncMessage {
        let mut m = SyncMessage::new(
            Some("ship-A".into()),
            "api::page.page",
            "d1",
            Operation::Update,
            Some(json!({})),
            1,
        );
        m.message_id = id.into();
        m
    }

    #[test]
    fn orphan_parks_as_exhausted() {
        let s = store();
        s.park(&msg("m1"), "orphan", Some("no mapping")).expect("park");
        let stats = s.stats().expect("stats");
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.total(), 1);
    }

    #[test]
    fn reparking_bumps_attempts_not_rows() {
        let s = store();
        let id1 = s.park(&msg("m1"), "transport", None).expect("park");
        let id2 = s.park(&msg("m1"), "transport", Some("again")).expect("repark");
        assert_eq!(id1, id2);
        let entry = s.get(id1).expect("get").expect("exists");
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("again"));
    }

    #[test]
    fn retry_lifecycle_settles_to_resolved_or_exhausted() {
        let s = store();
        let id = s.park(&msg("m1"), "orphan", None).expect("park");
        let replay = s.begin_retry(id).expect("begin").expect("message");
        assert_eq!(replay.message_id, "m1");
        assert_eq!(s.stats().expect("stats").retrying, 1);

        s.mark_retry_outcome(id, true, None).expect("settle");
        assert_eq!(s.stats().expect("stats").resolved, 1);
        // Resolved entries are not handed out again.
        assert!(s.begin_retry(id).expect("begin").is_none());
    }

    #[test]
    fn list_filters_by_state() {
        let s = store();
        s.park(&msg("m1"), "orphan", None).expect("park");
        let id = s.park(&msg("m2"), "serialization", None).expect("park");
        s.resolve(id, "discarded").expect("resolve");

        assert_eq!(s.list(None).expect("all").len(), 2);
        let exhausted = s.list(Some(DeadLetterState::Exhausted)).expect("filtered");
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].message.message_id, "m1");
    }
}
