//! Inbound apply pipeline.
//!
//! Every delivered record runs: dedup → validation → identity resolution →
//! per-document lock → conflict check → host apply → processed mark. The
//! outcome maps onto the transport disposition: transient failures retry,
//! unprocessable records park, everything else commits.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::host::{ContentTypeRegistry, HostApp, WriteOrigin};
use crate::locks::DocumentLocks;
use crate::store::conflicts::ConflictStore;
use crate::store::identity::IdentityMapper;
use crate::store::processed::MessageTracker;
use crate::store::ships::ShipTracker;
use crate::transport::{Disposition, MessageHandler};
use crate::types::{Operation, Role, SyncMessage};

use super::conflict::{self, LocalSnapshot, Resolution, StrategyMap};

pub struct InboundProcessor {
    role: Role,
    ship_id: Option<String>,
    tracker: Arc<MessageTracker>,
    mapper: Arc<IdentityMapper>,
    conflicts: Arc<ConflictStore>,
    locks: Arc<DocumentLocks>,
    host: Arc<dyn HostApp>,
    registry: Arc<ContentTypeRegistry>,
    strategies: StrategyMap,
    /// Present on the master: sightings refresh the ship registry.
    ships: Option<Arc<ShipTracker>>,
}

impl InboundProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        ship_id: Option<String>,
        tracker: Arc<MessageTracker>,
        mapper: Arc<IdentityMapper>,
        conflicts: Arc<ConflictStore>,
        locks: Arc<DocumentLocks>,
        host: Arc<dyn HostApp>,
        registry: Arc<ContentTypeRegistry>,
        strategies: StrategyMap,
        ships: Option<Arc<ShipTracker>>,
    ) -> Self {
        Self {
            role,
            ship_id,
            tracker,
            mapper,
            conflicts,
            locks,
            host,
            registry,
            strategies,
            ships,
        }
    }

    async fn process(&self, msg: &SyncMessage) -> Result<()> {
        msg.validate()?;
        if !self.registry.contains(&msg.content_type) {
            return Err(SyncError::Serialization(format!(
                "unsubscribed content type {:?}",
                msg.content_type
            )));
        }
        if let Some(payload) = &msg.payload {
            self.registry.validate_payload(&msg.content_type, payload)?;
        }

        if self.tracker.is_processed(&msg.message_id)? {
            debug!(message_id = %msg.message_id, "duplicate delivery; skipping");
            return Ok(());
        }

        // Serialize against other applies (and the conflict resolver's
        // version read) for this document.
        let _guard = self
            .locks
            .acquire(&msg.content_type, &msg.document_id)
            .await;

        // Re-check under the lock: a concurrent delivery may have won.
        if self.tracker.is_processed(&msg.message_id)? {
            return Ok(());
        }

        self.apply_under_lock(msg).await?;

        for superseded in &msg.supersedes {
            self.tracker.mark_superseded(msg, superseded)?;
        }
        self.tracker.mark_processed(msg)?;

        if let (Some(ships), Some(ship_id)) = (&self.ships, &msg.ship_id) {
            ships.upsert_seen(ship_id, ship_id)?;
        }
        Ok(())
    }

    async fn apply_under_lock(&self, msg: &SyncMessage) -> Result<()> {
        let local_id = self.mapper.resolve(&msg.content_type, &msg.document_id)?;

        let Some(local_id) = local_id else {
            if msg.operation == Operation::Create {
                return self.materialize(msg).await;
            }
            return Err(self.orphan(msg));
        };

        let current = self.host.get(&msg.content_type, &local_id).await?;
        let Some(current) = current else {
            // The mapping outlived its row. A create can rebuild it; anything
            // else is an orphan with a stale mapping.
            if msg.operation == Operation::Create {
                return self.materialize(msg).await;
            }
            return Err(self.orphan(msg));
        };

        if conflict::is_conflict(current.version, msg.base_version) {
            let strategy = self.strategies.for_content_type(&msg.content_type);
            let local = LocalSnapshot {
                version: current.version,
                payload: current.payload.clone(),
                updated_at: current.updated_at,
            };
            let resolution =
                conflict::resolve(&local, msg, strategy, self.role, self.ship_id.as_deref());
            info!(
                message_id = %msg.message_id,
                document_id = %msg.document_id,
                strategy = strategy.as_str(),
                resolution = resolution.reason(),
                "conflict detected"
            );
            match resolution {
                Resolution::ApplyRemote { .. } => {
                    self.conflicts
                        .record(msg, Some(&local.payload), Some(resolution.reason()))?;
                }
                Resolution::KeepLocal { reason } => {
                    self.conflicts.record(msg, Some(&local.payload), Some(reason))?;
                    return Ok(());
                }
                Resolution::Merged { payload, reason } => {
                    self.conflicts.record(msg, Some(&local.payload), Some(reason))?;
                    self.host
                        .update(&msg.content_type, &local_id, &payload, WriteOrigin::Sync)
                        .await?;
                    return Ok(());
                }
                Resolution::ParkRemote { reason } => {
                    debug!(reason, "conflict parks the remote message");
                    return Err(SyncError::Conflict {
                        content_type: msg.content_type.clone(),
                        document_id: msg.document_id.clone(),
                        base_version: msg.base_version,
                        local_version: local.version,
                    });
                }
                Resolution::Manual => {
                    let conflict_id = self.conflicts.record(msg, Some(&local.payload), None)?;
                    info!(conflict_id = %conflict_id, "apply paused for manual resolution");
                    return Ok(());
                }
            }
        }

        self.apply_operation(msg, &local_id).await
    }

    /// Create the local row for a first-seen document and bind its identity.
    async fn materialize(&self, msg: &SyncMessage) -> Result<()> {
        let payload = required_payload(msg)?;
        let record = self
            .host
            .create(&msg.content_type, &msg.document_id, payload, WriteOrigin::Sync)
            .await?;
        self.mapper
            .bind(&msg.content_type, &msg.document_id, &record.local_id)?;
        Ok(())
    }

    fn orphan(&self, msg: &SyncMessage) -> SyncError {
        SyncError::Orphan {
            content_type: msg.content_type.clone(),
            document_id: msg.document_id.clone(),
            operation: msg.operation.as_str().to_string(),
        }
    }

    async fn apply_operation(&self, msg: &SyncMessage, local_id: &str) -> Result<()> {
        match msg.operation {
            // A create with an existing mapping degrades to an update so
            // redeliveries stay idempotent.
            Operation::Create | Operation::Update => {
                self.host
                    .update(&msg.content_type, local_id, required_payload(msg)?, WriteOrigin::Sync)
                    .await?;
            }
            Operation::Delete => {
                self.host
                    .delete(&msg.content_type, local_id, WriteOrigin::Sync)
                    .await?;
                self.mapper.unbind(&msg.content_type, &msg.document_id)?;
            }
            Operation::Publish => {
                self.host
                    .set_published(&msg.content_type, local_id, true, WriteOrigin::Sync)
                    .await?;
            }
            Operation::Unpublish => {
                self.host
                    .set_published(&msg.content_type, local_id, false, WriteOrigin::Sync)
                    .await?;
            }
        }
        Ok(())
    }
}

fn required_payload(msg: &SyncMessage) -> Result<&serde_json::Value> {
    msg.payload.as_ref().ok_or_else(|| {
        SyncError::Serialization(format!("{} requires a payload", msg.operation))
    })
}

#[async_trait]
impl MessageHandler for InboundProcessor {
    async fn handle(&self, msg: SyncMessage) -> Disposition {
        match self.process(&msg).await {
            Ok(()) => Disposition::Ok,
            Err(err) => {
                let disposition = match &err {
                    SyncError::TransientNetwork(_) | SyncError::Storage(_) | SyncError::Shutdown => {
                        Disposition::Retry {
                            error: err.to_string(),
                        }
                    }
                    // Host rejections get exactly one in-place retry before
                    // parking.
                    SyncError::HostApply(_) if msg.attempt == 0 => Disposition::Retry {
                        error: err.to_string(),
                    },
                    _ => {
                        let _ = self.tracker.mark_failed(&msg);
                        Disposition::Dead {
                            reason: err.park_reason().to_string(),
                            error: err.to_string(),
                        }
                    }
                };
                warn!(
                    message_id = %msg.message_id,
                    attempt = msg.attempt,
                    error = %err,
                    "inbound apply failed"
                );
                disposition
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ContentTypeDef, MemoryHost};
    use crate::store::Db;
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        processor: InboundProcessor,
        host: Arc<MemoryHost>,
        tracker: Arc<MessageTracker>,
        mapper: Arc<IdentityMapper>,
        conflicts: Arc<ConflictStore>,
        ships: Arc<ShipTracker>,
    }

    fn fixture(role: Role) -> Fixture {
        let db = Db::open_in_memory().expect("db");
        let host = MemoryHost::new();
        let tracker = Arc::new(MessageTracker::new(Arc::clone(&db)));
        let mapper = Arc::new(IdentityMapper::new(Arc::clone(&db)));
        let conflicts = Arc::new(ConflictStore::new(Arc::clone(&db)));
        let ships = Arc::new(ShipTracker::new(Arc::clone(&db)));
        let registry = Arc::new(ContentTypeRegistry::new([ContentTypeDef {
            uid: "api::page.page".into(),
            required_fields: vec!["title".into()],
        }]));
        let processor = InboundProcessor::new(
            role,
            (role == Role::Replica).then(|| "ship-Z".to_string()),
            Arc::clone(&tracker),
            Arc::clone(&mapper),
            Arc::clone(&conflicts),
            Arc::new(DocumentLocks::new()),
            Arc::clone(&host) as Arc<dyn HostApp>,
            registry,
            StrategyMap::default(),
            (role == Role::Master).then(|| Arc::clone(&ships)),
        );
        Fixture {
            processor,
            host,
            tracker,
            mapper,
            conflicts,
            ships,
        }
    }

    fn create_msg(doc: &str) -> SyncMessage {
        SyncMessage::new(
            Some("ship-A".into()),
            "api::page.page",
            doc,
            Operation::Create,
            Some(json!({"title": "hello"})),
            0,
        )
    }

    fn update_msg(doc: &str, base: u64) -> SyncMessage {
        SyncMessage::new(
            Some("ship-A".into()),
            "api::page.page",
            doc,
            Operation::Update,
            Some(json!({"title": "updated"})),
            base,
        )
    }

    #[tokio::test]
    async fn create_binds_and_materializes() {
        let f = fixture(Role::Master);
        let disposition = f.processor.handle(create_msg("d1")).await;
        assert!(matches!(disposition, Disposition::Ok));
        assert!(f.mapper.resolve("api::page.page", "d1").expect("resolve").is_some());
        assert_eq!(f.host.record_count(), 1);
        // Sighting refreshed the ship registry.
        assert_eq!(f.ships.total_count().expect("ships"), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_applies_once() {
        let f = fixture(Role::Master);
        let msg = create_msg("d1");
        assert!(matches!(f.processor.handle(msg.clone()).await, Disposition::Ok));
        assert!(matches!(f.processor.handle(msg.clone()).await, Disposition::Ok));
        assert_eq!(f.host.record_count(), 1);
        // One write, not two: the second delivery was short-circuited.
        assert_eq!(f.host.write_log().len(), 1);
        assert!(f.tracker.is_processed(&msg.message_id).expect("processed"));
    }

    #[tokio::test]
    async fn orphan_update_is_dead_with_reason() {
        let f = fixture(Role::Replica);
        let msg = update_msg("d99", 1);
        let disposition = f.processor.handle(msg.clone()).await;
        match disposition {
            Disposition::Dead { reason, .. } => assert_eq!(reason, "orphan"),
            other => panic!("expected dead, got {other:?}"),
        }
        // Remembered as failed, so a later replay can still promote it.
        assert!(!f.tracker.is_processed(&msg.message_id).expect("not processed"));
        assert!(f.tracker.get(&msg.message_id).expect("get").is_some());
    }

    #[tokio::test]
    async fn orphan_succeeds_after_seeding() {
        let f = fixture(Role::Replica);
        let msg = update_msg("d99", 0);
        assert!(matches!(f.processor.handle(msg.clone()).await, Disposition::Dead { .. }));

        // Operator seeds the record, then the message is replayed.
        assert!(matches!(f.processor.handle(create_msg("d99")).await, Disposition::Ok));
        let disposition = f.processor.handle(msg.clone()).await;
        assert!(matches!(disposition, Disposition::Ok));
        assert!(f.tracker.is_processed(&msg.message_id).expect("promoted"));
    }

    #[tokio::test]
    async fn invalid_payload_is_dead_serialization() {
        let f = fixture(Role::Master);
        let mut msg = create_msg("d1");
        msg.payload = Some(json!({"not_title": 1}));
        match f.processor.handle(msg).await {
            Disposition::Dead { reason, .. } => assert_eq!(reason, "serialization"),
            other => panic!("expected dead, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lww_conflict_keeps_newer_local_and_records_resolution() {
        let f = fixture(Role::Master);
        // Local record exists at version 2 (create + update).
        assert!(matches!(f.processor.handle(create_msg("d1")).await, Disposition::Ok));
        let local = f.host.find_by_document("api::page.page", "d1").expect("record");
        f.host
            .update("api::page.page", &local.local_id, &json!({"title": "B"}), WriteOrigin::User)
            .await
            .expect("local edit");

        // Remote edit based on version 1, older than the local edit.
        let mut remote = update_msg("d1", 1);
        remote.occurred_at = Utc::now() - chrono::Duration::seconds(5);
        remote.payload = Some(json!({"title": "A"}));
        assert!(matches!(f.processor.handle(remote.clone()).await, Disposition::Ok));

        // Local title survives; the conflict is recorded resolved as older.
        let current = f.host.find_by_document("api::page.page", "d1").expect("record");
        assert_eq!(current.payload["title"], "B");
        let recorded = f.conflicts.list(None).expect("list");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].resolution.as_deref(), Some("older"));
        assert!(f.tracker.is_processed(&remote.message_id).expect("settled"));
    }

    #[tokio::test]
    async fn superseded_ids_short_circuit_late_deliveries() {
        let f = fixture(Role::Master);
        assert!(matches!(f.processor.handle(create_msg("d1")).await, Disposition::Ok));

        let mut late = update_msg("d1", 1);
        let late_id = late.message_id.clone();
        let mut survivor = update_msg("d1", 1);
        survivor.supersedes = vec![late_id.clone()];
        assert!(matches!(f.processor.handle(survivor).await, Disposition::Ok));

        // The coalesced-away message arrives afterwards and is skipped.
        late.payload = Some(json!({"title": "stale"}));
        assert!(matches!(f.processor.handle(late).await, Disposition::Ok));
        let current = f.host.find_by_document("api::page.page", "d1").expect("record");
        assert_eq!(current.payload["title"], "updated");
    }
}
