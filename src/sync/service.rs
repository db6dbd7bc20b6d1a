//! Sync service: the outbound orchestrator.
//!
//! Replicas route captured writes through the durable queue and drain it
//! whenever the link allows. The master publishes directly to the fan-out
//! topic and escalates producer failures straight to the dead-letter store.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::store::dead_letter::DeadLetterStore;
use crate::store::queue::SyncQueue;
use crate::transport::BusProducer;
use crate::types::Role;

use super::connectivity::ConnectivityMonitor;
use super::debounce::Debouncer;

/// Longest delay the exponential backoff can reach.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// `min(base × 2^attempt, 5min)` with ±20% uniform jitter.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(MAX_BACKOFF);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped.as_millis() as f64 * jitter) as u64)
}

/// Result of one `push()` drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub skipped: bool,
    pub sent: u64,
    pub failed: u64,
    pub parked: u64,
}

/// Result of `pull()`. Inbound flow is consumer-driven, so this stays a
/// placeholder for operator-initiated replays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullOutcome {
    pub replayed: u64,
}

pub struct SyncService {
    config: SyncConfig,
    queue: Arc<SyncQueue>,
    dead_letters: Arc<DeadLetterStore>,
    producer: Arc<dyn BusProducer>,
    monitor: Arc<ConnectivityMonitor>,
    debouncer: Arc<Debouncer>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        queue: Arc<SyncQueue>,
        dead_letters: Arc<DeadLetterStore>,
        producer: Arc<dyn BusProducer>,
        monitor: Arc<ConnectivityMonitor>,
        debouncer: Arc<Debouncer>,
    ) -> Self {
        Self {
            config,
            queue,
            dead_letters,
            producer,
            monitor,
            debouncer,
        }
    }

    // ------------------------------------------------------------------
    // Captured-write routing
    // ------------------------------------------------------------------

    /// Move debounced writes onward: replicas enqueue for the next drain,
    /// the master publishes directly. Returns how many messages moved.
    pub async fn flush_captured(&self) -> Result<u64> {
        self.route_messages(self.debouncer.take_due()).await
    }

    /// Shutdown path: flush everything still sitting in the window.
    pub async fn flush_all_captured(&self) -> Result<u64> {
        self.route_messages(self.debouncer.take_all()).await
    }

    async fn route_messages(&self, messages: Vec<crate::types::SyncMessage>) -> Result<u64> {
        let mut moved = 0;
        for msg in messages {
            match self.config.mode {
                Role::Replica => {
                    self.queue.enqueue(&msg)?;
                }
                // Master is direct-publish, no queue; a failed publish is
                // escalated to the dead-letter store.
                Role::Master => {
                    let topic = &self.config.topics.master_updates;
                    if let Err(e) = self.producer.publish(topic, &msg).await {
                        warn!(message_id = %msg.message_id, error = %e,
                            "master publish failed; dead-lettering");
                        let reason = if e.is_retriable() { "transport" } else { "serialization" };
                        self.dead_letters.park(&msg, reason, Some(&e.message))?;
                    }
                }
            }
            moved += 1;
        }
        Ok(moved)
    }

    // ------------------------------------------------------------------
    // push / pull
    // ------------------------------------------------------------------

    /// Drain the outbound queue. No-op on the master (it never queues) and
    /// when the link is down.
    pub async fn push(&self) -> Result<PushOutcome> {
        if self.config.mode == Role::Master {
            return Ok(PushOutcome {
                skipped: true,
                ..PushOutcome::default()
            });
        }
        if !self.monitor.is_online() {
            debug!("push skipped: link is offline");
            return Ok(PushOutcome {
                skipped: true,
                ..PushOutcome::default()
            });
        }

        // Config validation guarantees a ship id for replicas; a bare
        // service without one has nothing to drain.
        let Some(ship_id) = self.config.ship_id().map(String::from) else {
            return Ok(PushOutcome {
                skipped: true,
                ..PushOutcome::default()
            });
        };
        let topic = self.config.topics.ship_updates.clone();
        let mut outcome = PushOutcome::default();

        loop {
            let batch = self.queue.claim_batch(&ship_id, self.config.sync.batch_size)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                let mut msg = entry.message.clone();
                msg.attempt = entry.attempt;
                match self.producer.publish(&topic, &msg).await {
                    Ok(ack) => {
                        self.queue.mark_sent(entry.id)?;
                        outcome.sent += 1;
                        debug!(message_id = %msg.message_id, offset = ack.offset, "published");
                    }
                    Err(e) if e.is_retriable() => {
                        let attempts = self.queue.mark_failed(
                            entry.id,
                            &e.message,
                            backoff(self.config.retry_delay(), entry.attempt + 1),
                        )?;
                        if attempts >= self.config.sync.retry_attempts {
                            self.queue.mark_dead(entry.id, &e.message)?;
                            self.dead_letters
                                .park(&msg, "retries-exhausted", Some(&e.message))?;
                            outcome.parked += 1;
                        } else {
                            outcome.failed += 1;
                        }
                    }
                    Err(e) => {
                        // Fatal (serialization-class): retrying cannot help.
                        self.queue.mark_dead(entry.id, &e.message)?;
                        self.dead_letters
                            .park(&msg, "serialization", Some(&e.message))?;
                        outcome.parked += 1;
                    }
                }
            }
        }

        if outcome.sent > 0 || outcome.parked > 0 {
            info!(
                sent = outcome.sent,
                failed = outcome.failed,
                parked = outcome.parked,
                "push drain finished"
            );
        }
        Ok(outcome)
    }

    /// Inbound flow is consumer-driven; `pull` exists for operator-initiated
    /// replays and currently reports nothing to replay.
    pub fn pull(&self) -> PullOutcome {
        debug!("pull requested; inbound flow is consumer-driven");
        PullOutcome::default()
    }

    pub fn pending_count(&self) -> Result<u64> {
        match self.config.ship_id() {
            Some(ship_id) => self.queue.pending_count(ship_id),
            None => Ok(0),
        }
    }

    pub fn debounce_pending(&self) -> usize {
        self.debouncer.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Db;
    use crate::transport::memory::MemoryBus;
    use crate::transport::TransportError;
    use crate::types::{Operation, SyncMessage};
    use serde_json::json;

    fn msg(doc: &str) -> SyncMessage {
        SyncMessage::new(
            Some("ship-A".into()),
            "api::page.page",
            doc,
            Operation::Update,
            Some(json!({})),
            1,
        )
    }

    struct Fixture {
        bus: Arc<MemoryBus>,
        service: SyncService,
        queue: Arc<SyncQueue>,
        dlq: Arc<DeadLetterStore>,
        monitor: Arc<ConnectivityMonitor>,
    }

    fn fixture(mode: Role) -> Fixture {
        let db = Db::open_in_memory().expect("db");
        let bus = MemoryBus::new();
        let queue = Arc::new(SyncQueue::new(Arc::clone(&db)));
        let dlq = Arc::new(DeadLetterStore::new(Arc::clone(&db)));
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&bus) as Arc<dyn BusProducer>,
            Duration::from_secs(30),
        ));
        let config = SyncConfig {
            mode,
            ship_id: (mode == Role::Replica).then(|| "ship-A".to_string()),
            sync: crate::config::SyncTuning {
                retry_delay_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let service = SyncService::new(
            config,
            Arc::clone(&queue),
            Arc::clone(&dlq),
            Arc::clone(&bus) as Arc<dyn BusProducer>,
            Arc::clone(&monitor),
            Arc::new(Debouncer::new(Duration::from_millis(1))),
        );
        Fixture {
            bus,
            service,
            queue,
            dlq,
            monitor,
        }
    }

    #[test]
    fn backoff_is_bounded_and_jittered() {
        let base = Duration::from_secs(5);
        for attempt in 0..20 {
            let d = backoff(base, attempt);
            // Never above the cap plus jitter headroom.
            assert!(d <= Duration::from_secs(360), "attempt {attempt}: {d:?}");
        }
        let first = backoff(base, 0);
        assert!(first >= Duration::from_secs(4) && first <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn push_skips_when_offline() {
        let f = fixture(Role::Replica);
        f.queue.enqueue(&msg("d1")).expect("enqueue");
        // Monitor starts pessimistic; no probe has run.
        let outcome = f.service.push().await.expect("push");
        assert!(outcome.skipped);
        assert_eq!(f.queue.pending_count("ship-A").expect("count"), 1);
    }

    #[tokio::test]
    async fn push_drains_queue_when_online() {
        let f = fixture(Role::Replica);
        f.queue.enqueue(&msg("d1")).expect("enqueue");
        f.queue.enqueue(&msg("d2")).expect("enqueue");
        f.monitor.check_connectivity().await;

        let outcome = f.service.push().await.expect("push");
        assert_eq!(outcome.sent, 2);
        assert!(!outcome.skipped);
        assert_eq!(f.bus.topic_len("ship-updates"), 2);
        assert_eq!(f.queue.pending_count("ship-A").expect("count"), 0);
    }

    #[tokio::test]
    async fn transient_failure_backs_off_then_parks() {
        let f = fixture(Role::Replica);
        f.queue.enqueue(&msg("d1")).expect("enqueue");
        f.monitor.check_connectivity().await;

        // Each round fails the publish; the backoff keeps the entry out of
        // the same drain, so we force it due again between rounds. After the
        // attempt budget the message must be parked, not lost.
        let mut rounds = 0;
        while f.dlq.stats().expect("stats").total() == 0 {
            rounds += 1;
            assert!(rounds <= 4, "message should have parked by now");
            f.bus.fail_next_publish(TransportError::transient("broker gone"));
            f.service.push().await.expect("push");
            for entry in f.queue.snapshot("ship-A", Some(&[crate::types::QueueState::Pending])).expect("snapshot") {
                f.queue.mark_failed(entry.id, "made due", Duration::ZERO).expect("reset");
            }
        }
        let stats = f.dlq.stats().expect("stats");
        assert_eq!(stats.exhausted, 1);
        assert_eq!(f.bus.topic_len("ship-updates"), 0);
    }

    #[tokio::test]
    async fn fatal_failure_parks_immediately() {
        let f = fixture(Role::Replica);
        f.queue.enqueue(&msg("d1")).expect("enqueue");
        f.monitor.check_connectivity().await;
        f.bus.fail_next_publish(TransportError::fatal("unencodable"));

        let outcome = f.service.push().await.expect("push");
        assert_eq!(outcome.parked, 1);
        assert_eq!(outcome.sent, 0);
        let parked = f.dlq.list(None).expect("list");
        assert_eq!(parked[0].reason, "serialization");
    }

    #[tokio::test]
    async fn master_push_is_a_noop() {
        let f = fixture(Role::Master);
        let outcome = f.service.push().await.expect("push");
        assert!(outcome.skipped);
    }

    #[tokio::test]
    async fn master_routes_direct_and_escalates_failures() {
        let f = fixture(Role::Master);
        let mut m = msg("d1");
        m.ship_id = None;
        f.service.debouncer.offer(m);
        let mut failing = msg("d2");
        failing.ship_id = None;
        f.service.debouncer.offer(failing);

        tokio::time::sleep(Duration::from_millis(5)).await;
        f.bus.fail_next_publish(TransportError::transient("broker gone"));
        let moved = f.service.flush_captured().await.expect("flush");
        assert_eq!(moved, 2);
        // One landed on the fan-out topic, the other was dead-lettered.
        assert_eq!(f.bus.topic_len("master-updates"), 1);
        assert_eq!(f.dlq.stats().expect("stats").total(), 1);
    }

    #[tokio::test]
    async fn replica_routes_captured_writes_into_queue() {
        let f = fixture(Role::Replica);
        f.service.debouncer.offer(msg("d1"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let moved = f.service.flush_captured().await.expect("flush");
        assert_eq!(moved, 1);
        assert_eq!(f.queue.pending_count("ship-A").expect("count"), 1);
    }
}
