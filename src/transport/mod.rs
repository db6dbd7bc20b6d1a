//! Bus transport seam.
//!
//! The real bus client is external; the engine depends on two narrow traits.
//! Delivery is at-least-once — exactly-once *effect* comes from the
//! processed-message ledger. Published records carry the `messageId` as
//! their key so a key-aware partitioner preserves per-document order.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::dead_letter::DeadLetterStore;
use crate::types::SyncMessage;

// ============================================================================
// Errors and acks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Network-class failure; the send may be retried.
    Transient,
    /// Serialization or protocol failure; retrying cannot help.
    Fatal,
}

/// Transport-level error (wraps arbitrary error strings from the bus layer).
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    pub kind: TransportErrorKind,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Transient,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Fatal,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// Broker acknowledgement for a published record.
#[derive(Debug, Clone)]
pub struct PublishAck {
    pub topic: String,
    pub offset: u64,
}

// ============================================================================
// Producer / consumer contracts
// ============================================================================

/// Publishes outbound records. Implementations own their connection; the
/// engine shares nothing with them beyond topic names.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Publish one message, keyed by its `messageId`.
    async fn publish(
        &self,
        topic: &str,
        msg: &SyncMessage,
    ) -> std::result::Result<PublishAck, TransportError>;

    /// Cheap health probe with a short timeout; doubles as the link probe.
    async fn ping(&self) -> std::result::Result<Duration, TransportError>;
}

/// What the inbound pipeline decided about one delivered record.
#[derive(Debug, Clone)]
pub enum Disposition {
    /// Applied (or intentionally skipped); safe to commit.
    Ok,
    /// Transient failure; redeliver with backoff.
    Retry { error: String },
    /// Unprocessable; park and commit past it.
    Dead { reason: String, error: String },
}

/// Inbound record handler (the apply pipeline).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: SyncMessage) -> Disposition;
}

/// Pull side of the bus: `fetch` returns the record after the committed
/// offset (redelivering it until `commit` is called).
#[async_trait]
pub trait BusConsumer: Send + Sync {
    async fn fetch(&self) -> std::result::Result<Option<SyncMessage>, TransportError>;
    async fn commit(&self) -> std::result::Result<(), TransportError>;
}

// ============================================================================
// ConsumerLoop — disposition handling around a BusConsumer
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub applied: u64,
    pub parked: u64,
}

/// Drives a [`BusConsumer`]: dispatches each record to the handler,
/// reschedules `Retry` with exponential backoff, parks `Dead` records in
/// the dead-letter store, and commits only once a record is settled.
pub struct ConsumerLoop {
    consumer: Arc<dyn BusConsumer>,
    handler: Arc<dyn MessageHandler>,
    dead_letters: Arc<DeadLetterStore>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ConsumerLoop {
    pub fn new(
        consumer: Arc<dyn BusConsumer>,
        handler: Arc<dyn MessageHandler>,
        dead_letters: Arc<DeadLetterStore>,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            consumer,
            handler,
            dead_letters,
            retry_attempts,
            retry_delay,
        }
    }

    /// Process records until the topic is drained. Used by tests and
    /// operator-initiated replays; production wiring calls [`run`](Self::run).
    pub async fn drain(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            let msg = match self.consumer.fetch().await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(summary),
                Err(e) if e.is_retriable() => {
                    debug!(error = %e, "fetch failed; ending drain");
                    return Ok(summary);
                }
                Err(e) => return Err(crate::error::SyncError::TransientNetwork(e.message)),
            };
            self.settle(msg, &mut summary).await?;
        }
    }

    /// Continuous consumption until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            if *shutdown.borrow() {
                return Ok(summary);
            }
            match self.consumer.fetch().await {
                Ok(Some(msg)) => self.settle(msg, &mut summary).await?,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.retry_delay.min(Duration::from_millis(200))) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "bus fetch failed; backing off");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Settle one record: it is either applied or parked before commit.
    async fn settle(&self, msg: SyncMessage, summary: &mut DrainSummary) -> Result<()> {
        let mut attempt = msg.attempt;
        loop {
            let mut delivery = msg.clone();
            delivery.attempt = attempt;
            match self.handler.handle(delivery).await {
                Disposition::Ok => {
                    summary.applied += 1;
                    break;
                }
                Disposition::Dead { reason, error } => {
                    self.dead_letters.park(&msg, &reason, Some(&error))?;
                    summary.parked += 1;
                    break;
                }
                Disposition::Retry { error } => {
                    attempt += 1;
                    if attempt >= self.retry_attempts {
                        self.dead_letters
                            .park(&msg, "retries-exhausted", Some(&error))?;
                        summary.parked += 1;
                        break;
                    }
                    let delay = crate::sync::service::backoff(self.retry_delay, attempt);
                    debug!(
                        message_id = %msg.message_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "rescheduling inbound record"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.consumer
            .commit()
            .await
            .map_err(|e| crate::error::SyncError::TransientNetwork(e.message))?;
        Ok(())
    }
}
