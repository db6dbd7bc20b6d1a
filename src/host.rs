//! Narrow contract over the host CMS / entity service.
//!
//! The engine never touches business tables directly: every read and apply
//! goes through [`HostApp`]. Writes carry a [`WriteOrigin`] so the change
//! capture hook can tell user mutations from apply-originated ones and break
//! echo loops.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Result, SyncError};

// ============================================================================
// WriteOrigin — echo prevention tag
// ============================================================================

/// Ambient per-operation tag distinguishing user writes from inbound-apply
/// writes. Writes tagged `Sync` are never re-captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    User,
    Sync,
}

// ============================================================================
// EntityRecord
// ============================================================================

/// The engine's view of a host entity row.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    /// Host-assigned primary key. Differs between sites.
    pub local_id: String,
    /// Stable cross-site identity.
    pub document_id: String,
    /// Monotonic per-record version, bumped by every host write.
    pub version: u64,
    pub payload: Value,
    pub published: bool,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Content-type registry
// ============================================================================

/// Shape constraints for one content type, fetched from the host at startup.
#[derive(Debug, Clone, Default)]
pub struct ContentTypeDef {
    pub uid: String,
    /// Fields that must be present (and non-null) in every payload.
    pub required_fields: Vec<String>,
}

/// String-keyed registry of subscribed content types. Dispatch is by name;
/// payloads are validated against the registered shape before apply.
#[derive(Default)]
pub struct ContentTypeRegistry {
    types: BTreeMap<String, ContentTypeDef>,
}

impl ContentTypeRegistry {
    pub fn new(defs: impl IntoIterator<Item = ContentTypeDef>) -> Self {
        Self {
            types: defs.into_iter().map(|d| (d.uid.clone(), d)).collect(),
        }
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.types.contains_key(uid)
    }

    pub fn get(&self, uid: &str) -> Option<&ContentTypeDef> {
        self.types.get(uid)
    }

    /// Validate an inbound payload against the registered shape.
    pub fn validate_payload(&self, uid: &str, payload: &Value) -> Result<()> {
        let def = self
            .types
            .get(uid)
            .ok_or_else(|| SyncError::Serialization(format!("unknown content type {uid:?}")))?;
        let obj = payload
            .as_object()
            .ok_or_else(|| SyncError::Serialization(format!("{uid} payload must be an object")))?;
        for field in &def.required_fields {
            match obj.get(field) {
                Some(v) if !v.is_null() => {}
                _ => {
                    return Err(SyncError::Serialization(format!(
                        "{uid} payload missing required field {field:?}"
                    )))
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// HostApp
// ============================================================================

/// Entity read/apply surface of the host. All apply paths are transactional
/// on the host side; version bumps are the host's responsibility.
#[async_trait]
pub trait HostApp: Send + Sync {
    async fn get(&self, content_type: &str, local_id: &str) -> Result<Option<EntityRecord>>;

    /// Create a row for `document_id` and return it (with the host-assigned
    /// `local_id` and version 1).
    async fn create(
        &self,
        content_type: &str,
        document_id: &str,
        payload: &Value,
        origin: WriteOrigin,
    ) -> Result<EntityRecord>;

    async fn update(
        &self,
        content_type: &str,
        local_id: &str,
        payload: &Value,
        origin: WriteOrigin,
    ) -> Result<EntityRecord>;

    async fn delete(&self, content_type: &str, local_id: &str, origin: WriteOrigin) -> Result<()>;

    async fn set_published(
        &self,
        content_type: &str,
        local_id: &str,
        published: bool,
        origin: WriteOrigin,
    ) -> Result<EntityRecord>;

    /// Liveness probe for the readiness endpoint.
    fn is_healthy(&self) -> bool {
        true
    }
}

// ============================================================================
// MemoryHost — in-process host for tests and local wiring
// ============================================================================

type EntityKey = (String, String);

/// An in-memory [`HostApp`]. Assigns sequential local ids so master and
/// replica instances naturally diverge, the way real hosts do.
#[derive(Default)]
pub struct MemoryHost {
    entities: RwLock<BTreeMap<EntityKey, EntityRecord>>,
    next_id: RwLock<u64>,
    /// `(content_type, operation, origin)` log for capture-filter assertions.
    writes: RwLock<Vec<(String, &'static str, WriteOrigin)>>,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed with a starting local-id offset so two hosts assign different
    /// primary keys for the same logical records.
    pub fn with_id_offset(offset: u64) -> Arc<Self> {
        let host = Self::default();
        *host.next_id.write() = offset;
        Arc::new(host)
    }

    fn key(content_type: &str, local_id: &str) -> EntityKey {
        (content_type.to_string(), local_id.to_string())
    }

    fn log(&self, content_type: &str, op: &'static str, origin: WriteOrigin) {
        self.writes.write().push((content_type.to_string(), op, origin));
    }

    pub fn write_log(&self) -> Vec<(String, &'static str, WriteOrigin)> {
        self.writes.read().clone()
    }

    /// Find a record by its document id (test convenience).
    pub fn find_by_document(&self, content_type: &str, document_id: &str) -> Option<EntityRecord> {
        self.entities
            .read()
            .iter()
            .find(|((ct, _), record)| ct == content_type && record.document_id == document_id)
            .map(|(_, record)| record.clone())
    }

    pub fn record_count(&self) -> usize {
        self.entities.read().len()
    }
}

#[async_trait]
impl HostApp for MemoryHost {
    async fn get(&self, content_type: &str, local_id: &str) -> Result<Option<EntityRecord>> {
        Ok(self
            .entities
            .read()
            .get(&Self::key(content_type, local_id))
            .cloned())
    }

    async fn create(
        &self,
        content_type: &str,
        document_id: &str,
        payload: &Value,
        origin: WriteOrigin,
    ) -> Result<EntityRecord> {
        let local_id = {
            let mut next = self.next_id.write();
            *next += 1;
            format!("local-{next}", next = *next)
        };
        let record = EntityRecord {
            local_id: local_id.clone(),
            document_id: document_id.to_string(),
            version: 1,
            payload: payload.clone(),
            published: false,
            updated_at: Utc::now(),
        };
        self.entities
            .write()
            .insert(Self::key(content_type, &local_id), record.clone());
        self.log(content_type, "create", origin);
        Ok(record)
    }

    async fn update(
        &self,
        content_type: &str,
        local_id: &str,
        payload: &Value,
        origin: WriteOrigin,
    ) -> Result<EntityRecord> {
        let mut entities = self.entities.write();
        let record = entities
            .get_mut(&Self::key(content_type, local_id))
            .ok_or_else(|| SyncError::HostApply(format!("no such entity {content_type}/{local_id}")))?;
        record.payload = payload.clone();
        record.version += 1;
        record.updated_at = Utc::now();
        let out = record.clone();
        drop(entities);
        self.log(content_type, "update", origin);
        Ok(out)
    }

    async fn delete(&self, content_type: &str, local_id: &str, origin: WriteOrigin) -> Result<()> {
        let removed = self
            .entities
            .write()
            .remove(&Self::key(content_type, local_id));
        if removed.is_none() {
            return Err(SyncError::HostApply(format!(
                "no such entity {content_type}/{local_id}"
            )));
        }
        self.log(content_type, "delete", origin);
        Ok(())
    }

    async fn set_published(
        &self,
        content_type: &str,
        local_id: &str,
        published: bool,
        origin: WriteOrigin,
    ) -> Result<EntityRecord> {
        let mut entities = self.entities.write();
        let record = entities
            .get_mut(&Self::key(content_type, local_id))
            .ok_or_else(|| SyncError::HostApply(format!("no such entity {content_type}/{local_id}")))?;
        record.published = published;
        record.version += 1;
        record.updated_at = Utc::now();
        let out = record.clone();
        drop(entities);
        self.log(content_type, if published { "publish" } else { "unpublish" }, origin);
        Ok(out)
    }
}
