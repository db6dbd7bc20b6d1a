//! shipsync — offline-tolerant bidirectional replication for fleets of
//! intermittently-connected edge sites.
//!
//! One process is the authoritative `master`; every edge site runs a
//! `replica` identified by a ship id. Local mutations are captured,
//! debounced, queued durably and shipped over an at-least-once bus;
//! inbound mutations are deduplicated, conflict-checked and applied with
//! exactly-once effect. The host CMS, HTTP router, bus client and blob
//! SDKs stay external, behind narrow traits.

pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod locks;
pub mod media;
pub mod metrics;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;

pub use config::{BusConfig, MediaConfig, SyncConfig, SyncTuning, TopicsConfig};
pub use engine::{HealthReport, StatusReport, SyncEngine};
pub use error::{Result, SyncError};
pub use host::{ContentTypeDef, ContentTypeRegistry, EntityRecord, HostApp, MemoryHost, WriteOrigin};
pub use sync::{
    ChangeCapture, ConflictStrategy, ConnectivityMonitor, Debouncer, InboundProcessor, InitialSync,
    InitialSyncRequest, LinkEvent, LinkProbe, MasterApi, PushOutcome, SyncScheduler, SyncService,
};
pub use transport::{
    memory::MemoryBus, BusConsumer, BusProducer, ConsumerLoop, Disposition, MessageHandler,
    PublishAck, TransportError, TransportErrorKind,
};
pub use types::{
    ConnectivityStatus, DeadLetterState, Operation, ProcessedStatus, QueueState, Role, Ship,
    SyncMessage,
};
