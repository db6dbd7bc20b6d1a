//! Engine assembly and the status surface.
//!
//! [`SyncEngine`] wires the stores, transport, capture hook and background
//! tasks for one process. The host's HTTP router stays external; every
//! endpoint maps onto one typed method here.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::host::{ContentTypeDef, ContentTypeRegistry, HostApp, WriteOrigin};
use crate::locks::DocumentLocks;
use crate::media::{BlobStore, MediaMirror, MediaStats};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::store::conflicts::ConflictStore;
use crate::store::dead_letter::{DeadLetterStats, DeadLetterStore};
use crate::store::identity::IdentityMapper;
use crate::store::processed::MessageTracker;
use crate::store::queue::SyncQueue;
use crate::store::ships::ShipTracker;
use crate::store::Db;
use crate::sync::connectivity::{ConnectivityMonitor, LinkEvent, LinkProbe};
use crate::sync::initial::{InitialSync, InitialSyncReport, InitialSyncRequest, InitialSyncStatus, MasterApi};
use crate::sync::service::{PullOutcome, PushOutcome};
use crate::sync::{ChangeCapture, Debouncer, InboundProcessor, StrategyMap, SyncScheduler, SyncService};
use crate::transport::{BusProducer, Disposition, MessageHandler};
use crate::types::{ConflictRecord, ConflictState, QueueEntry, QueueState, Role, Ship};

// ============================================================================
// Status payloads
// ============================================================================

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub mode: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ship_id: Option<String>,
    pub queue_size: u64,
    pub connectivity: Option<LinkProbe>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    pub database: bool,
    pub bus: bool,
    pub queue_pending: u64,
    pub open_conflicts: u64,
    pub dead_letter: DeadLetterStatsView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaStats>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStatsView {
    pub pending: u64,
    pub retrying: u64,
    pub exhausted: u64,
    pub resolved: u64,
}

impl From<DeadLetterStats> for DeadLetterStatsView {
    fn from(s: DeadLetterStats) -> Self {
        Self {
            pending: s.pending,
            retrying: s.retrying,
            exhausted: s.exhausted,
            resolved: s.resolved,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub mode: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ship_id: Option<String>,
    pub checks: HealthChecks,
}

// ============================================================================
// SyncEngine
// ============================================================================

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    db: Arc<Db>,
    tracker: Arc<MessageTracker>,
    queue: Arc<SyncQueue>,
    dead_letters: Arc<DeadLetterStore>,
    ships: Arc<ShipTracker>,
    mapper: Arc<IdentityMapper>,
    conflicts: Arc<ConflictStore>,
    host: Arc<dyn HostApp>,
    producer: Arc<dyn BusProducer>,
    monitor: Arc<ConnectivityMonitor>,
    service: Arc<SyncService>,
    capture: Arc<ChangeCapture>,
    processor: Arc<InboundProcessor>,
    initial: Arc<InitialSync>,
    media: Option<Arc<MediaMirror>>,
    metrics: SyncMetrics,
}

impl SyncEngine {
    /// Assemble an engine from a validated configuration and the external
    /// collaborators. Fails fast on configuration errors; revives queue
    /// entries stranded by a previous crash.
    pub fn new(
        config: SyncConfig,
        host: Arc<dyn HostApp>,
        producer: Arc<dyn BusProducer>,
        content_types: Vec<ContentTypeDef>,
        media_origin: Option<Arc<dyn BlobStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let db = match &config.database_path {
            Some(path) => Db::open(path)?,
            None => Db::open_in_memory()?,
        };

        let tracker = Arc::new(MessageTracker::new(Arc::clone(&db)));
        let queue = Arc::new(SyncQueue::new(Arc::clone(&db)));
        queue.revive_stuck()?;
        let dead_letters = Arc::new(DeadLetterStore::new(Arc::clone(&db)));
        let ships = Arc::new(ShipTracker::new(Arc::clone(&db)));
        let mapper = Arc::new(IdentityMapper::new(Arc::clone(&db)));
        let conflicts = Arc::new(ConflictStore::new(Arc::clone(&db)));
        let locks = Arc::new(DocumentLocks::new());

        let registry = Arc::new(ContentTypeRegistry::new(content_types));
        let debouncer = Arc::new(Debouncer::new(config.debounce_window()));
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&producer),
            config.connectivity_check_interval(),
        ));
        let service = Arc::new(SyncService::new(
            config.clone(),
            Arc::clone(&queue),
            Arc::clone(&dead_letters),
            Arc::clone(&producer),
            Arc::clone(&monitor),
            Arc::clone(&debouncer),
        ));
        let capture = Arc::new(ChangeCapture::new(
            Arc::clone(&registry),
            config.ship_id.clone(),
            Arc::clone(&debouncer),
        ));
        let processor = Arc::new(InboundProcessor::new(
            config.mode,
            config.ship_id.clone(),
            Arc::clone(&tracker),
            Arc::clone(&mapper),
            Arc::clone(&conflicts),
            Arc::clone(&locks),
            Arc::clone(&host),
            Arc::clone(&registry),
            StrategyMap::from_config(&config.conflict_strategies),
            (config.mode == Role::Master).then(|| Arc::clone(&ships)),
        ));
        let initial = Arc::new(InitialSync::new(
            Arc::clone(&mapper),
            Arc::clone(&host),
            config.content_types.clone(),
        ));
        let media = match (&media_origin, config.media.enabled) {
            (Some(origin), true) => Some(Arc::new(MediaMirror::new(
                Arc::clone(origin),
                Arc::new(crate::media::FsBlobStore::new(config.media.cache_dir.clone()))
                    as Arc<dyn BlobStore>,
                std::time::Duration::from_millis(config.media.interval_ms),
                config.media.concurrency,
            ))),
            _ => None,
        };
        let metrics = SyncMetrics::new(&config.mode.to_string(), config.ship_id())?;

        info!(mode = %config.mode, ship_id = ?config.ship_id, "sync engine assembled");
        Ok(Self {
            config,
            db,
            tracker,
            queue,
            dead_letters,
            ships,
            mapper,
            conflicts,
            host,
            producer,
            monitor,
            service,
            capture,
            processor,
            initial,
            media,
            metrics,
        })
    }

    // ------------------------------------------------------------------
    // Component access for host wiring
    // ------------------------------------------------------------------

    /// The hook the host invokes from its write lifecycle.
    pub fn capture(&self) -> Arc<ChangeCapture> {
        Arc::clone(&self.capture)
    }

    /// The inbound handler to hand to a bus consumer loop.
    pub fn processor(&self) -> Arc<InboundProcessor> {
        Arc::clone(&self.processor)
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterStore> {
        Arc::clone(&self.dead_letters)
    }

    pub fn identity(&self) -> Arc<IdentityMapper> {
        Arc::clone(&self.mapper)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Spawn the background loops. The returned scheduler owns them; pass it
    /// back to [`shutdown`](Self::shutdown) on exit. A `went_online` edge
    /// immediately drains the outbound queue.
    pub fn start_background(&self) -> SyncScheduler {
        let service = Arc::clone(&self.service);
        let handle = tokio::runtime::Handle::current();
        self.monitor.subscribe(Arc::new(move |event| {
            if event == LinkEvent::WentOnline {
                let service = Arc::clone(&service);
                handle.spawn(async move {
                    if let Err(e) = service.push().await {
                        tracing::warn!(error = %e, "online-edge drain failed");
                    }
                });
            }
        }));
        SyncScheduler::start(
            &self.config,
            Arc::clone(&self.service),
            Arc::clone(&self.monitor),
            Arc::clone(&self.queue),
            Arc::clone(&self.tracker),
            (self.config.mode == Role::Master).then(|| Arc::clone(&self.ships)),
            self.media.clone(),
        )
    }

    /// Graceful shutdown: stop the background loops (which flush the
    /// debounce window), then quiesce the database. Entries in `sending`
    /// are revived at next startup.
    pub async fn shutdown(&self, scheduler: SyncScheduler) {
        scheduler.shutdown().await;
        self.db.begin_shutdown();
        info!("sync engine stopped");
    }

    // ------------------------------------------------------------------
    // Status surface (one method per endpoint)
    // ------------------------------------------------------------------

    /// On-demand link probe (also runs on the background timer).
    pub async fn check_connectivity(&self) -> LinkProbe {
        self.monitor.check_connectivity().await
    }

    /// `GET /status`
    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            mode: self.config.mode,
            ship_id: self.config.ship_id.clone(),
            queue_size: self.service.pending_count()?,
            connectivity: self.monitor.last_probe(),
        })
    }

    /// `POST /push`
    pub async fn push(&self) -> Result<PushOutcome> {
        self.service.flush_captured().await?;
        self.service.push().await
    }

    /// `POST /pull`
    pub fn pull(&self) -> PullOutcome {
        self.service.pull()
    }

    /// `GET /queue`
    pub fn queue_view(&self) -> Result<Vec<QueueEntry>> {
        match self.config.ship_id() {
            Some(ship_id) => self.queue.snapshot(ship_id, None),
            None => Ok(Vec::new()),
        }
    }

    /// `GET /queue/pending`
    pub fn queue_pending(&self) -> Result<Vec<QueueEntry>> {
        match self.config.ship_id() {
            Some(ship_id) => self
                .queue
                .snapshot(ship_id, Some(&[QueueState::Pending, QueueState::Sending])),
            None => Ok(Vec::new()),
        }
    }

    /// `GET /ships` (master only)
    pub fn ships(&self) -> Result<Vec<Ship>> {
        if self.config.mode != Role::Master {
            return Err(SyncError::Config("ship registry is master-only".into()));
        }
        self.ships.list_ships()
    }

    /// `GET /conflicts`
    pub fn conflicts(&self, state: Option<ConflictState>) -> Result<Vec<ConflictRecord>> {
        self.conflicts.list(state)
    }

    /// `GET /conflicts/:id`
    pub fn conflict(&self, id: &str) -> Result<Option<ConflictRecord>> {
        self.conflicts.get(id)
    }

    /// `POST /conflicts/:id/resolve` — settle an open conflict.
    ///
    /// `strategy` picks a side (`"local"` keeps the local state, `"remote"`
    /// applies the parked remote snapshot); `data` overrides both with an
    /// operator-merged payload.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        strategy: &str,
        data: Option<Value>,
    ) -> Result<bool> {
        let record = self
            .conflicts
            .get(id)?
            .ok_or_else(|| SyncError::Config(format!("no such conflict {id:?}")))?;
        if record.state == ConflictState::Resolved {
            return Ok(false);
        }

        let payload = match (strategy, data) {
            (_, Some(data)) => Some(data),
            ("remote", None) => record.remote_snapshot.clone(),
            ("local", None) => None,
            (other, None) => {
                return Err(SyncError::Config(format!(
                    "unknown resolution strategy {other:?} (expected local, remote, or data)"
                )))
            }
        };

        if let Some(payload) = payload {
            let local_id = self
                .mapper
                .resolve(&record.content_type, &record.document_id)?
                .ok_or_else(|| SyncError::Orphan {
                    content_type: record.content_type.clone(),
                    document_id: record.document_id.clone(),
                    operation: "resolve".to_string(),
                })?;
            self.host
                .update(&record.content_type, &local_id, &payload, WriteOrigin::Sync)
                .await?;
        }
        self.conflicts.mark_resolved(id, strategy)
    }

    /// Replay a parked dead-letter entry through the apply pipeline
    /// (operator retry, e.g. after seeding an orphan's record). Returns
    /// `true` when the replay applied and the entry resolved; `false` when
    /// it failed again (entry back to `exhausted`) or the id is unknown or
    /// already resolved.
    pub async fn retry_dead_letter(&self, id: i64) -> Result<bool> {
        let Some(msg) = self.dead_letters.begin_retry(id)? else {
            return Ok(false);
        };
        let disposition = self.processor.handle(msg).await;
        let (succeeded, error) = match &disposition {
            Disposition::Ok => (true, None),
            Disposition::Retry { error } => (false, Some(error.as_str())),
            Disposition::Dead { error, .. } => (false, Some(error.as_str())),
        };
        self.dead_letters.mark_retry_outcome(id, succeeded, error)?;
        Ok(succeeded)
    }

    /// `POST /initial-sync/pull`
    pub async fn initial_sync(
        &self,
        api: &dyn MasterApi,
        request: &InitialSyncRequest,
    ) -> Result<InitialSyncReport> {
        if self.config.mode != Role::Replica {
            return Err(SyncError::Config("initial sync is replica-only".into()));
        }
        self.initial.run(api, request).await
    }

    /// `GET /initial-sync/status`
    pub fn initial_sync_status(&self) -> InitialSyncStatus {
        self.initial.status()
    }

    /// `GET /media/stats` and `GET /media/health`
    pub fn media_stats(&self) -> Option<MediaStats> {
        self.media.as_ref().map(|m| m.stats())
    }

    /// `POST /media/sync`
    pub async fn media_sync(&self) -> Result<MediaStats> {
        match &self.media {
            Some(media) => media.sync_once().await,
            None => Err(SyncError::Config("media sync is not configured".into())),
        }
    }

    /// `GET /health/live`
    pub fn health_live(&self) -> bool {
        true
    }

    /// `GET /health/ready` — database and bus reachable.
    pub async fn health_ready(&self) -> bool {
        let db_ok = !self.db.is_shutting_down() && self.tracker.stats().is_ok();
        let bus_ok = self.producer.ping().await.is_ok();
        db_ok && bus_ok && self.host.is_healthy()
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<HealthReport> {
        let database = !self.db.is_shutting_down() && self.tracker.stats().is_ok();
        let bus = self.producer.ping().await.is_ok();
        let checks = HealthChecks {
            database,
            bus,
            queue_pending: self.service.pending_count()?,
            open_conflicts: self.conflicts.open_count()?,
            dead_letter: self.dead_letters.stats()?.into(),
            media: self.media_stats(),
        };
        Ok(HealthReport {
            status: if database && bus { "ok" } else { "degraded" },
            mode: self.config.mode,
            ship_id: self.config.ship_id.clone(),
            checks,
        })
    }

    /// `GET /metrics` — Prometheus text exposition.
    pub fn metrics_text(&self) -> Result<String> {
        let snapshot = MetricsSnapshot {
            messages: self.tracker.stats()?,
            ships_total: self.ships.total_count()?,
            ships_online: self.ships.online_count()?,
            queue_pending: self.service.pending_count()?,
            dead_letters: self.dead_letters.stats()?,
        };
        self.metrics.render(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::transport::memory::MemoryBus;
    use crate::types::{Operation, SyncMessage};
    use serde_json::json;

    fn engine(mode: Role) -> SyncEngine {
        let config = SyncConfig {
            mode,
            ship_id: (mode == Role::Replica).then(|| "ship-A".to_string()),
            content_types: vec!["api::page.page".into()],
            ..Default::default()
        };
        SyncEngine::new(
            config,
            MemoryHost::new(),
            MemoryBus::new(),
            vec![ContentTypeDef {
                uid: "api::page.page".into(),
                required_fields: vec![],
            }],
            None,
        )
        .expect("engine")
    }

    #[tokio::test]
    async fn status_reports_role_and_queue() {
        let e = engine(Role::Replica);
        let status = e.status().expect("status");
        assert_eq!(status.mode, Role::Replica);
        assert_eq!(status.ship_id.as_deref(), Some("ship-A"));
        assert_eq!(status.queue_size, 0);
    }

    #[tokio::test]
    async fn ships_endpoint_is_master_only() {
        assert!(engine(Role::Replica).ships().is_err());
        assert!(engine(Role::Master).ships().expect("ships").is_empty());
    }

    #[tokio::test]
    async fn readiness_follows_bus_health() {
        let config = SyncConfig {
            mode: Role::Replica,
            ship_id: Some("ship-A".into()),
            ..Default::default()
        };
        let bus = MemoryBus::new();
        let e = SyncEngine::new(config, MemoryHost::new(), Arc::clone(&bus) as Arc<dyn BusProducer>, vec![], None)
            .expect("engine");
        assert!(e.health_ready().await);
        bus.set_offline(true);
        assert!(!e.health_ready().await);
        let health = e.health().await.expect("health");
        assert_eq!(health.status, "degraded");
        assert!(health.checks.database);
        assert!(!health.checks.bus);
    }

    #[tokio::test]
    async fn dead_letter_retry_replays_through_the_pipeline() {
        let e = engine(Role::Replica);
        let orphan = SyncMessage::new(
            None,
            "api::page.page",
            "d9",
            Operation::Update,
            Some(json!({"title": "phantom"})),
            0,
        );
        let id = e
            .dead_letters()
            .park(&orphan, "orphan", Some("no mapping"))
            .expect("park");

        // Still orphaned: the replay fails and the entry stays exhausted.
        assert!(!e.retry_dead_letter(id).await.expect("retry"));
        assert_eq!(e.dead_letters().stats().expect("stats").exhausted, 1);

        // Seed the record, then the retry applies and resolves the entry.
        let seed = SyncMessage::new(
            None,
            "api::page.page",
            "d9",
            Operation::Create,
            Some(json!({"title": "seeded"})),
            0,
        );
        assert!(matches!(e.processor().handle(seed).await, Disposition::Ok));
        assert!(e.retry_dead_letter(id).await.expect("retry"));
        assert_eq!(e.dead_letters().stats().expect("stats").resolved, 1);
        // Unknown or already-resolved ids report false without side effects.
        assert!(!e.retry_dead_letter(id).await.expect("resolved"));
        assert!(!e.retry_dead_letter(9999).await.expect("unknown"));
    }

    #[tokio::test]
    async fn metrics_text_renders() {
        let e = engine(Role::Master);
        let text = e.metrics_text().expect("metrics");
        assert!(text.contains("offline_sync_info"));
        assert!(text.contains("mode=\"master\""));
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let config = SyncConfig {
            mode: Role::Replica,
            ship_id: None,
            ..Default::default()
        };
        let err = SyncEngine::new(config, MemoryHost::new(), MemoryBus::new(), vec![], None)
            .expect_err("must fail");
        assert!(matches!(err, SyncError::Config(_)));
    }
}
