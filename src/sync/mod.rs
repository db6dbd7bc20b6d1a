//! Replication state machine: capture, debounce, dispatch, inbound apply,
//! conflict resolution, connectivity and bootstrap.

pub mod capture;
pub mod conflict;
pub mod connectivity;
pub mod consumer;
pub mod debounce;
pub mod initial;
pub mod scheduler;
pub mod service;

pub use capture::ChangeCapture;
pub use conflict::{ConflictStrategy, Resolution, StrategyMap};
pub use connectivity::{ConnectivityMonitor, LinkEvent, LinkProbe};
pub use consumer::InboundProcessor;
pub use debounce::Debouncer;
pub use initial::{InitialSync, InitialSyncRequest, MasterApi};
pub use scheduler::SyncScheduler;
pub use service::{PushOutcome, SyncService};
