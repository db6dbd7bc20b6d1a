//! Durable outbound queue (replica side).
//!
//! FIFO by `occurred_at` with insertion order as the tie-break. Claiming is
//! a single transaction that flips `pending → sending`, so concurrent
//! dispatchers can never double-claim an entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{QueueEntry, QueueState, SyncMessage};

use super::{parse_ts, ts, Db};

pub struct SyncQueue {
    db: Arc<Db>,
}

impl SyncQueue {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Persist a message for dispatch. Immediately claimable.
    pub fn enqueue(&self, msg: &SyncMessage) -> Result<i64> {
        let now = ts(Utc::now());
        let ship_id = msg.ship_id.clone().unwrap_or_default();
        let body = serde_json::to_string(msg)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_queue
                     (message_id, ship_id, content_type, document_id, operation,
                      message, state, attempt, next_attempt_at, occurred_at, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?7)",
                params![
                    msg.message_id,
                    ship_id,
                    msg.content_type,
                    msg.document_id,
                    msg.operation.as_str(),
                    body,
                    now,
                    ts(msg.occurred_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Claim up to `n` due entries, atomically moving them to `sending`.
    /// Only `pending` entries whose `next_attempt_at` has passed qualify.
    pub fn claim_batch(&self, ship_id: &str, n: usize) -> Result<Vec<QueueEntry>> {
        let now = ts(Utc::now());
        self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, message, state, attempt, next_attempt_at, last_error, enqueued_at
                   FROM sync_queue
                  WHERE ship_id = ?1 AND state = 'pending' AND next_attempt_at <= ?2
                  ORDER BY occurred_at, id
                  LIMIT ?3",
            )?;
            let mut entries = stmt
                .query_map(params![ship_id, now, n as i64], row_to_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);
            for entry in &mut entries {
                tx.execute(
                    "UPDATE sync_queue SET state = 'sending' WHERE id = ?1",
                    params![entry.id],
                )?;
                entry.state = QueueState::Sending;
            }
            Ok(entries)
        })
    }

    /// Record a successful publish.
    pub fn mark_sent(&self, entry_id: i64) -> Result<()> {
        let now = ts(Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue SET state = 'sent', sent_at = ?2, last_error = NULL
                  WHERE id = ?1",
                params![entry_id, now],
            )?;
            Ok(())
        })
    }

    /// Record a failed publish and schedule the retry. The entry returns to
    /// `pending` so the next drain past `next_attempt_at` picks it up.
    /// Returns the new attempt count.
    pub fn mark_failed(&self, entry_id: i64, error: &str, backoff: Duration) -> Result<u32> {
        let next = ts(Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero()));
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE sync_queue
                    SET state = 'pending', attempt = attempt + 1,
                        next_attempt_at = ?2, last_error = ?3
                  WHERE id = ?1",
                params![entry_id, next, error],
            )?;
            let attempt: u32 = tx.query_row(
                "SELECT attempt FROM sync_queue WHERE id = ?1",
                params![entry_id],
                |row| row.get(0),
            )?;
            Ok(attempt)
        })
    }

    /// Terminal failure: the message is being parked in the dead-letter
    /// store, so the queue entry leaves the dispatch rotation for good.
    pub fn mark_dead(&self, entry_id: i64, error: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue SET state = 'failed', last_error = ?2 WHERE id = ?1",
                params![entry_id, error],
            )?;
            Ok(())
        })
    }

    /// Revive entries stranded in `sending` by a crash. Run once at startup.
    pub fn revive_stuck(&self) -> Result<usize> {
        let revived = self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE sync_queue SET state = 'pending' WHERE state = 'sending'",
                [],
            )?;
            Ok(n)
        })?;
        if revived > 0 {
            warn!(revived, "revived sync-queue entries stuck in sending");
        }
        Ok(revived)
    }

    /// Drop `sent` entries whose ack has aged past the retention window.
    pub fn prune_sent(&self, older_than: Duration) -> Result<usize> {
        let cutoff = ts(Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero()));
        let pruned = self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM sync_queue WHERE state = 'sent' AND sent_at < ?1",
                params![cutoff],
            )?;
            Ok(n)
        })?;
        if pruned > 0 {
            debug!(pruned, "pruned acknowledged queue entries");
        }
        Ok(pruned)
    }

    pub fn pending_count(&self, ship_id: &str) -> Result<u64> {
        self.db.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE ship_id = ?1 AND state IN ('pending', 'sending')",
                params![ship_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// Full queue view for the operator surface, oldest first.
    pub fn snapshot(&self, ship_id: &str, states: Option<&[QueueState]>) -> Result<Vec<QueueEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message, state, attempt, next_attempt_at, last_error, enqueued_at
                   FROM sync_queue WHERE ship_id = ?1 ORDER BY occurred_at, id",
            )?;
            let entries = stmt
                .query_map(params![ship_id], row_to_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(match states {
                Some(filter) => entries
                    .into_iter()
                    .filter(|e| filter.contains(&e.state))
                    .collect(),
                None => entries,
            })
        })
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let body: String = row.get(1)?;
    let state: String = row.get(2)?;
    let next_attempt_at: String = row.get(4)?;
    let enqueued_at: String = row.get(6)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        message: serde_json::from_str(&body).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        state: QueueState::parse(&state).unwrap_or(QueueState::Failed),
        attempt: row.get(3)?,
        next_attempt_at: parse_rfc3339(&next_attempt_at),
        last_error: row.get(5)?,
        enqueued_at: parse_rfc3339(&enqueued_at),
    })
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    parse_ts(raw).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;
    use serde_json::json;

    fn queue() -> SyncQueue {
        SyncQueue::new(Db::open_in_memory().expect("open"))
    }

    fn msg(doc: &str, occurred_at: DateTime<Utc>) -> SyncMessage {
        let mut m = SyncMessage::new(
            Some("ship-A".into()),
            "api::page.page",
            doc,
            Operation::Update,
            Some(json!({"doc": doc})),
            1,
        );
        m.occurred_at = occurred_at;
        m
    }

    #[test]
    fn claim_is_fifo_by_occurred_at() {
        let q = queue();
        let base = Utc::now();
        q.enqueue(&msg("d2", base + chrono::Duration::seconds(2))).expect("enqueue");
        q.enqueue(&msg("d1", base)).expect("enqueue");
        q.enqueue(&msg("d3", base + chrono::Duration::seconds(4))).expect("enqueue");

        let batch = q.claim_batch("ship-A", 10).expect("claim");
        let docs: Vec<&str> = batch.iter().map(|e| e.message.document_id.as_str()).collect();
        assert_eq!(docs, vec!["d1", "d2", "d3"]);
        assert!(batch.iter().all(|e| e.state == QueueState::Sending));
    }

    #[test]
    fn claimed_entries_are_not_reclaimed() {
        let q = queue();
        q.enqueue(&msg("d1", Utc::now())).expect("enqueue");
        assert_eq!(q.claim_batch("ship-A", 10).expect("claim").len(), 1);
        assert!(q.claim_batch("ship-A", 10).expect("reclaim").is_empty());
    }

    #[test]
    fn failed_entries_wait_for_backoff() {
        let q = queue();
        q.enqueue(&msg("d1", Utc::now())).expect("enqueue");
        let entry = &q.claim_batch("ship-A", 1).expect("claim")[0];
        let attempt = q
            .mark_failed(entry.id, "broker unreachable", Duration::from_secs(60))
            .expect("fail");
        assert_eq!(attempt, 1);
        // Entry is pending again but not yet due.
        assert!(q.claim_batch("ship-A", 1).expect("not due").is_empty());
        assert_eq!(q.pending_count("ship-A").expect("count"), 1);
    }

    #[test]
    fn revive_returns_sending_to_pending() {
        let q = queue();
        q.enqueue(&msg("d1", Utc::now())).expect("enqueue");
        q.claim_batch("ship-A", 1).expect("claim");
        assert_eq!(q.revive_stuck().expect("revive"), 1);
        assert_eq!(q.claim_batch("ship-A", 1).expect("reclaim").len(), 1);
    }

    #[test]
    fn sent_entries_leave_pending_and_prune() {
        let q = queue();
        q.enqueue(&msg("d1", Utc::now())).expect("enqueue");
        let entry = &q.claim_batch("ship-A", 1).expect("claim")[0];
        q.mark_sent(entry.id).expect("sent");
        assert_eq!(q.pending_count("ship-A").expect("count"), 0);
        // Fresh acks stay for the operator view; aged acks are pruned.
        assert_eq!(q.prune_sent(Duration::from_secs(3600)).expect("prune"), 0);
        assert_eq!(q.prune_sent(Duration::ZERO).expect("prune"), 1);
        assert!(q.snapshot("ship-A", None).expect("snapshot").is_empty());
    }

    #[test]
    fn snapshot_filters_by_state() {
        let q = queue();
        q.enqueue(&msg("d1", Utc::now())).expect("enqueue");
        q.enqueue(&msg("d2", Utc::now())).expect("enqueue");
        let batch = q.claim_batch("ship-A", 1).expect("claim");
        q.mark_dead(batch[0].id, "exhausted").expect("dead");

        let pending = q
            .snapshot("ship-A", Some(&[QueueState::Pending]))
            .expect("snapshot");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.document_id, "d2");
    }
}
