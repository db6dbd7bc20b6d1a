//! In-process bus used by tests and single-node wiring.
//!
//! Honors the transport contract: at-least-once delivery, per-consumer
//! committed offsets, and injectable faults so retry paths can be exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::SyncMessage;

use super::{BusConsumer, BusProducer, PublishAck, TransportError};

// ============================================================================
// MemoryBus
// ============================================================================

#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<SyncMessage>>>,
    offline: AtomicBool,
    /// Errors consumed one per publish; lets tests script broker failures.
    publish_faults: Mutex<VecDeque<TransportError>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the link dropping (publishes and pings fail transiently).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Queue an error for the next publish call.
    pub fn fail_next_publish(&self, err: TransportError) {
        self.publish_faults.lock().push_back(err);
    }

    pub fn topic_len(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    pub fn topic_messages(&self, topic: &str) -> Vec<SyncMessage> {
        self.topics.lock().get(topic).cloned().unwrap_or_default()
    }

    /// Create a consumer with its own committed offset.
    pub fn subscribe(self: &Arc<Self>, topic: &str) -> Arc<MemoryConsumer> {
        Arc::new(MemoryConsumer {
            bus: Arc::clone(self),
            topic: topic.to_string(),
            committed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        msg: &SyncMessage,
    ) -> std::result::Result<PublishAck, TransportError> {
        if let Some(fault) = self.publish_faults.lock().pop_front() {
            return Err(fault);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::transient("link down"));
        }
        let mut topics = self.topics.lock();
        let records = topics.entry(topic.to_string()).or_default();
        records.push(msg.clone());
        Ok(PublishAck {
            topic: topic.to_string(),
            offset: (records.len() - 1) as u64,
        })
    }

    async fn ping(&self) -> std::result::Result<Duration, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(TransportError::transient("link down"))
        } else {
            Ok(Duration::from_millis(1))
        }
    }
}

// ============================================================================
// MemoryConsumer
// ============================================================================

pub struct MemoryConsumer {
    bus: Arc<MemoryBus>,
    topic: String,
    committed: AtomicUsize,
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn fetch(&self) -> std::result::Result<Option<SyncMessage>, TransportError> {
        if self.bus.offline.load(Ordering::SeqCst) {
            return Err(TransportError::transient("link down"));
        }
        let topics = self.bus.topics.lock();
        let records = topics.get(&self.topic);
        let offset = self.committed.load(Ordering::SeqCst);
        Ok(records.and_then(|r| r.get(offset)).cloned())
    }

    async fn commit(&self) -> std::result::Result<(), TransportError> {
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
