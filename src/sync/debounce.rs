//! Outbound write coalescing.
//!
//! Repeated writes to the same `(contentType, documentId)` within the
//! debounce window collapse into a single outbound message carrying the
//! latest payload. Superseded message ids ride on the survivor so a
//! consumer can short-circuit a late out-of-order delivery.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{Operation, SyncMessage};

type DocKey = (String, String);

struct PendingWrite {
    message: SyncMessage,
    deadline: Instant,
}

pub struct Debouncer {
    window: Duration,
    pending: Mutex<HashMap<DocKey, PendingWrite>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Offer a freshly captured message. Returns immediately; the message
    /// becomes eligible for dispatch once its window closes undisturbed.
    pub fn offer(&self, msg: SyncMessage) {
        let key = (msg.content_type.clone(), msg.document_id.clone());
        let deadline = Instant::now() + self.window;
        let mut pending = self.pending.lock();

        let merged = match pending.remove(&key) {
            None => msg,
            Some(prev) => match coalesce(prev.message, msg) {
                Some(survivor) => survivor,
                None => {
                    // Create followed by delete inside the window cancels out:
                    // the record never becomes visible remotely.
                    debug!(
                        content_type = %key.0,
                        document_id = %key.1,
                        "debounce cancelled create+delete pair"
                    );
                    return;
                }
            },
        };
        pending.insert(key, PendingWrite {
            message: merged,
            deadline,
        });
    }

    /// Remove and return messages whose window has closed, oldest first.
    pub fn take_due(&self) -> Vec<SyncMessage> {
        let now = Instant::now();
        self.take_where(|w| w.deadline <= now)
    }

    /// Remove and return everything, regardless of deadline (shutdown path).
    pub fn take_all(&self) -> Vec<SyncMessage> {
        self.take_where(|_| true)
    }

    fn take_where(&self, pred: impl Fn(&PendingWrite) -> bool) -> Vec<SyncMessage> {
        let mut pending = self.pending.lock();
        let due: Vec<DocKey> = pending
            .iter()
            .filter(|(_, w)| pred(w))
            .map(|(k, _)| k.clone())
            .collect();
        let mut out: Vec<SyncMessage> = due
            .into_iter()
            .filter_map(|k| pending.remove(&k))
            .map(|w| w.message)
            .collect();
        out.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        out
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Fold `prev` into `next`. The survivor keeps the latest payload and id,
/// the earliest base version (so conflict detection still sees the
/// pre-burst state), and accumulates superseded ids. Returns `None` when
/// the pair annihilates (create then delete).
fn coalesce(prev: SyncMessage, mut next: SyncMessage) -> Option<SyncMessage> {
    if prev.operation == Operation::Create && next.operation == Operation::Delete {
        return None;
    }
    // A create must stay a create: the receiving site has no mapping yet.
    if prev.operation == Operation::Create && next.operation == Operation::Update {
        next.operation = Operation::Create;
    }
    next.base_version = next.base_version.min(prev.base_version);
    let mut superseded = prev.supersedes;
    superseded.push(prev.message_id);
    superseded.extend(std::mem::take(&mut next.supersedes));
    next.supersedes = superseded;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(doc: &str, op: Operation, payload: Option<serde_json::Value>, base: u64) -> SyncMessage {
        SyncMessage::new(Some("ship-A".into()), "api::page.page", doc, op, payload, base)
    }

    #[test]
    fn k_writes_collapse_to_one_with_last_payload() {
        let d = Debouncer::new(Duration::from_millis(50));
        let first = msg("d1", Operation::Update, Some(json!({"n": 1})), 3);
        let first_id = first.message_id.clone();
        d.offer(first);
        let second = msg("d1", Operation::Update, Some(json!({"n": 2})), 4);
        let second_id = second.message_id.clone();
        d.offer(second);
        d.offer(msg("d1", Operation::Update, Some(json!({"n": 3})), 5));

        let out = d.take_all();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, Some(json!({"n": 3})));
        // Earliest observed base survives for conflict detection.
        assert_eq!(out[0].base_version, 3);
        assert_eq!(out[0].supersedes, vec![first_id, second_id]);
    }

    #[test]
    fn distinct_documents_do_not_coalesce() {
        let d = Debouncer::new(Duration::from_millis(50));
        d.offer(msg("d1", Operation::Update, Some(json!({})), 1));
        d.offer(msg("d2", Operation::Update, Some(json!({})), 1));
        assert_eq!(d.take_all().len(), 2);
    }

    #[test]
    fn nothing_is_due_before_the_window_closes() {
        let d = Debouncer::new(Duration::from_secs(60));
        d.offer(msg("d1", Operation::Update, Some(json!({})), 1));
        assert!(d.take_due().is_empty());
        assert_eq!(d.pending_count(), 1);
    }

    #[tokio::test]
    async fn due_after_window_elapses() {
        let d = Debouncer::new(Duration::from_millis(5));
        d.offer(msg("d1", Operation::Update, Some(json!({})), 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(d.take_due().len(), 1);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn create_then_update_stays_a_create() {
        let d = Debouncer::new(Duration::from_millis(50));
        d.offer(msg("d1", Operation::Create, Some(json!({"n": 1})), 0));
        d.offer(msg("d1", Operation::Update, Some(json!({"n": 2})), 1));
        let out = d.take_all();
        assert_eq!(out[0].operation, Operation::Create);
        assert_eq!(out[0].payload, Some(json!({"n": 2})));
    }

    #[test]
    fn create_then_delete_cancels_out() {
        let d = Debouncer::new(Duration::from_millis(50));
        d.offer(msg("d1", Operation::Create, Some(json!({})), 0));
        let mut delete = msg("d1", Operation::Delete, None, 1);
        delete.payload = None;
        d.offer(delete);
        assert!(d.take_all().is_empty());
    }

    #[test]
    fn update_then_delete_keeps_the_delete() {
        let d = Debouncer::new(Duration::from_millis(50));
        d.offer(msg("d1", Operation::Update, Some(json!({})), 3));
        d.offer(msg("d1", Operation::Delete, None, 4));
        let out = d.take_all();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].operation, Operation::Delete);
        assert!(out[0].payload.is_none());
        assert_eq!(out[0].supersedes.len(), 1);
    }
}
