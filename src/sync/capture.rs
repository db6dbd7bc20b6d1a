//! Change capture: turns host write-lifecycle events into sync messages.
//!
//! The host invokes one hook per write (`after_create`, `after_update`,
//! ...). Writes tagged `origin = Sync` came from an inbound apply and are
//! dropped here, which is what breaks the replication echo loop.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::host::{ContentTypeRegistry, EntityRecord, WriteOrigin};
use crate::types::{Operation, SyncMessage};

use super::debounce::Debouncer;

pub struct ChangeCapture {
    registry: Arc<ContentTypeRegistry>,
    /// `None` on the master.
    ship_id: Option<String>,
    debouncer: Arc<Debouncer>,
}

impl ChangeCapture {
    pub fn new(
        registry: Arc<ContentTypeRegistry>,
        ship_id: Option<String>,
        debouncer: Arc<Debouncer>,
    ) -> Self {
        Self {
            registry,
            ship_id,
            debouncer,
        }
    }

    pub fn after_create(&self, content_type: &str, record: &EntityRecord, origin: WriteOrigin) {
        self.capture(content_type, Operation::Create, record, origin);
    }

    pub fn after_update(&self, content_type: &str, record: &EntityRecord, origin: WriteOrigin) {
        self.capture(content_type, Operation::Update, record, origin);
    }

    pub fn after_delete(&self, content_type: &str, record: &EntityRecord, origin: WriteOrigin) {
        self.capture(content_type, Operation::Delete, record, origin);
    }

    pub fn after_publish(&self, content_type: &str, record: &EntityRecord, origin: WriteOrigin) {
        self.capture(content_type, Operation::Publish, record, origin);
    }

    pub fn after_unpublish(&self, content_type: &str, record: &EntityRecord, origin: WriteOrigin) {
        self.capture(content_type, Operation::Unpublish, record, origin);
    }

    fn capture(
        &self,
        content_type: &str,
        operation: Operation,
        record: &EntityRecord,
        origin: WriteOrigin,
    ) {
        if origin == WriteOrigin::Sync {
            trace!(content_type, document_id = %record.document_id, %operation,
                "skipping apply-originated write");
            return;
        }
        if !self.registry.contains(content_type) {
            trace!(content_type, "content type not subscribed; not captured");
            return;
        }

        // Post-image payload; deletes carry none. The base version is what
        // the writer observed before this write.
        let payload = match operation {
            Operation::Delete => None,
            _ => Some(record.payload.clone()),
        };
        let base_version = record.version.saturating_sub(1);

        let msg = SyncMessage::new(
            self.ship_id.clone(),
            content_type,
            record.document_id.clone(),
            operation,
            payload,
            base_version,
        );
        debug!(
            message_id = %msg.message_id,
            content_type,
            document_id = %record.document_id,
            %operation,
            "captured local mutation"
        );
        self.debouncer.offer(msg);
    }
}
