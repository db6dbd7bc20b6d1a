//! Wire and record types shared across the replication engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

// ============================================================================
// Role
// ============================================================================

/// Which side of the replication topology this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Single authoritative site.
    Master,
    /// Edge site identified by a `shipId`; may be offline for long periods.
    Replica,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

// ============================================================================
// Operation
// ============================================================================

/// Entity lifecycle operations replicated between sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Publish,
    Unpublish,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Publish => "publish",
            Operation::Unpublish => "unpublish",
        }
    }

    pub fn parse(s: &str) -> Option<Operation> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            "publish" => Some(Operation::Publish),
            "unpublish" => Some(Operation::Unpublish),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// SyncMessage — the unit of replication
// ============================================================================

/// Generate a new message id.
///
/// UUIDv7: time-ordered, so ids from one writer sort by creation time and
/// `(shipId, occurredAt)` stays non-decreasing per ship.
pub fn new_message_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// A replication event on the wire. JSON field names are the wire contract;
/// unknown fields are captured in `extra` and re-emitted on serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub message_id: String,
    /// Origin site; `None` means master-originated.
    pub ship_id: Option<String>,
    /// Qualified entity kind, e.g. `"api::page.page"`. Opaque to the engine.
    pub content_type: String,
    /// Stable cross-site identity of the record.
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    pub operation: Operation,
    /// Post-image snapshot; `None` for deletes.
    #[serde(default)]
    pub payload: Option<Value>,
    /// Version the writer observed before its write.
    pub base_version: u64,
    /// Wall-clock of the mutation at origin (UTC).
    pub occurred_at: DateTime<Utc>,
    /// Delivery attempt counter.
    #[serde(default)]
    pub attempt: u32,
    /// Ids coalesced away by the debounce window. A consumer that sees the
    /// survivor first can short-circuit late deliveries of these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<String>,
    /// Unknown wire fields, preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SyncMessage {
    /// Build a message for a fresh local mutation.
    pub fn new(
        ship_id: Option<String>,
        content_type: impl Into<String>,
        document_id: impl Into<String>,
        operation: Operation,
        payload: Option<Value>,
        base_version: u64,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            ship_id,
            content_type: content_type.into(),
            document_id: document_id.into(),
            locale: None,
            operation,
            payload,
            base_version,
            occurred_at: Utc::now(),
            attempt: 0,
            supersedes: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Check the structural invariants a message must satisfy before apply.
    pub fn validate(&self) -> Result<()> {
        if self.message_id.is_empty() {
            return Err(SyncError::Serialization("empty messageId".into()));
        }
        if self.content_type.is_empty() || self.document_id.is_empty() {
            return Err(SyncError::Serialization(
                "contentType and documentId are required".into(),
            ));
        }
        match self.operation {
            Operation::Delete if self.payload.is_some() => Err(SyncError::Serialization(
                "delete must not carry a payload".into(),
            )),
            Operation::Create | Operation::Update if self.payload.is_none() => Err(
                SyncError::Serialization(format!("{} requires a payload", self.operation)),
            ),
            _ => Ok(()),
        }
    }

    /// Rank used to break last-write-wins ties deterministically: master
    /// outranks every ship, ships order lexicographically.
    pub fn writer_rank(&self) -> WriterRank<'_> {
        match &self.ship_id {
            None => WriterRank::Master,
            Some(id) => WriterRank::Ship(id),
        }
    }
}

/// Writer identity ordered for tie-breaking. `Master` compares greater than
/// any ship; ships compare lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterRank<'a> {
    Ship(&'a str),
    Master,
}

impl PartialOrd for WriterRank<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WriterRank<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use WriterRank::*;
        match (self, other) {
            (Master, Master) => std::cmp::Ordering::Equal,
            (Master, Ship(_)) => std::cmp::Ordering::Greater,
            (Ship(_), Master) => std::cmp::Ordering::Less,
            (Ship(a), Ship(b)) => a.cmp(b),
        }
    }
}

// ============================================================================
// Queue / dead-letter / processed records
// ============================================================================

/// Outbound queue entry state machine. `Sending` entries found at startup
/// are revived to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Sending => "sending",
            QueueState::Sent => "sent",
            QueueState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<QueueState> {
        match s {
            "pending" => Some(QueueState::Pending),
            "sending" => Some(QueueState::Sending),
            "sent" => Some(QueueState::Sent),
            "failed" => Some(QueueState::Failed),
            _ => None,
        }
    }
}

/// A durable outbound mutation awaiting dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: i64,
    pub message: SyncMessage,
    pub state: QueueState,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Dead-letter entry state machine. Entries are never auto-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterState {
    Pending,
    Retrying,
    Exhausted,
    Resolved,
}

impl DeadLetterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterState::Pending => "pending",
            DeadLetterState::Retrying => "retrying",
            DeadLetterState::Exhausted => "exhausted",
            DeadLetterState::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<DeadLetterState> {
        match s {
            "pending" => Some(DeadLetterState::Pending),
            "retrying" => Some(DeadLetterState::Retrying),
            "exhausted" => Some(DeadLetterState::Exhausted),
            "resolved" => Some(DeadLetterState::Resolved),
            _ => None,
        }
    }
}

/// A message that exhausted its retries (or was unprocessable outright),
/// parked for operator attention.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: i64,
    pub message: SyncMessage,
    pub state: DeadLetterState,
    pub reason: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Terminal status of a processed message. `Failed` may later be promoted to
/// `Processed` by a replay; the reverse transition is forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessedStatus {
    Processed,
    Failed,
}

impl ProcessedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedStatus::Processed => "processed",
            ProcessedStatus::Failed => "failed",
        }
    }
}

/// Ledger row proving a message id was seen, for exactly-once effect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMessage {
    pub message_id: String,
    pub ship_id: Option<String>,
    pub content_type: String,
    pub document_id: String,
    pub operation: Operation,
    pub status: ProcessedStatus,
    pub processed_at: DateTime<Utc>,
}

// ============================================================================
// Ships
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Online,
    Offline,
}

impl ConnectivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityStatus::Online => "online",
            ConnectivityStatus::Offline => "offline",
        }
    }
}

/// A known replica and when it was last heard from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ship {
    pub ship_id: String,
    pub ship_name: String,
    pub connectivity_status: ConnectivityStatus,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Conflicts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictState {
    Open,
    Resolved,
}

/// A detected write-write conflict held for resolution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub message_id: String,
    pub content_type: String,
    pub document_id: String,
    pub local_snapshot: Option<Value>,
    pub remote_snapshot: Option<Value>,
    pub detected_at: DateTime<Utc>,
    pub state: ConflictState,
    pub resolution: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_ids_are_monotonic_across_milliseconds() {
        let a = new_message_id();
        // v7 ordering is only guaranteed at millisecond granularity.
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_message_id();
        assert!(a < b, "v7 ids must sort by creation time: {a} !< {b}");
    }

    #[test]
    fn delete_with_payload_is_invalid() {
        let mut msg = SyncMessage::new(
            Some("ship-A".into()),
            "api::page.page",
            "d1",
            Operation::Delete,
            None,
            3,
        );
        assert!(msg.validate().is_ok());
        msg.payload = Some(json!({"title": "x"}));
        assert!(msg.validate().is_err());
    }

    #[test]
    fn create_requires_payload() {
        let msg = SyncMessage::new(None, "api::page.page", "d1", Operation::Create, None, 0);
        assert!(msg.validate().is_err());
    }

    #[test]
    fn unknown_wire_fields_round_trip() {
        let raw = json!({
            "messageId": "01890000-0000-7000-8000-000000000000",
            "shipId": "ship-A",
            "contentType": "api::page.page",
            "documentId": "d1",
            "operation": "update",
            "payload": {"title": "hello"},
            "baseVersion": 3,
            "occurredAt": "2024-05-01T12:00:00Z",
            "attempt": 0,
            "futureField": {"nested": true}
        });
        let msg: SyncMessage = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(msg.extra["futureField"], json!({"nested": true}));
        let back = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(back["futureField"], json!({"nested": true}));
    }

    #[test]
    fn master_outranks_every_ship() {
        let master = SyncMessage::new(None, "t", "d", Operation::Update, Some(json!({})), 0);
        let ship = SyncMessage::new(Some("zz-last".into()), "t", "d", Operation::Update, Some(json!({})), 0);
        assert!(master.writer_rank() > ship.writer_rank());
        let a = SyncMessage::new(Some("ship-A".into()), "t", "d", Operation::Update, Some(json!({})), 0);
        let b = SyncMessage::new(Some("ship-B".into()), "t", "d", Operation::Update, Some(json!({})), 0);
        assert!(b.writer_rank() > a.writer_rank());
    }
}
