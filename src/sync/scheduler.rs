//! Background task wiring.
//!
//! Owns the timers: connectivity probing, debounce flushing, periodic push,
//! ship staleness sweeps and ledger retention. Shutdown is a watch channel;
//! tasks exit at the next tick and are joined in reverse dependency order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::media::MediaMirror;
use crate::store::processed::MessageTracker;
use crate::store::queue::SyncQueue;
use crate::store::ships::ShipTracker;
use crate::types::Role;

use super::connectivity::ConnectivityMonitor;
use super::service::SyncService;

/// How often captured writes are checked against their debounce deadline.
const FLUSH_TICK: Duration = Duration::from_millis(250);

/// Housekeeping cadence (retention cleanup, queue pruning, staleness sweeps).
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(60);

pub struct SyncScheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SyncScheduler {
    /// Spawn the background loops for this role. Requires a running tokio
    /// runtime.
    pub fn start(
        config: &SyncConfig,
        service: Arc<SyncService>,
        monitor: Arc<ConnectivityMonitor>,
        queue: Arc<SyncQueue>,
        tracker: Arc<MessageTracker>,
        ships: Option<Arc<ShipTracker>>,
        media: Option<Arc<MediaMirror>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        // Debounce pump: move due captured writes onward.
        {
            let service = Arc::clone(&service);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        // Flush whatever is still in the window before exit.
                        if let Err(e) = service.flush_all_captured().await {
                            warn!(error = %e, "final debounce flush failed");
                        }
                        return;
                    }
                    if let Err(e) = service.flush_captured().await {
                        debug!(error = %e, "debounce flush failed");
                    }
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(FLUSH_TICK) => {}
                    }
                }
            }));
        }

        if config.mode == Role::Replica {
            // Connectivity probe loop.
            {
                let monitor = Arc::clone(&monitor);
                let shutdown = shutdown_rx.clone();
                handles.push(tokio::spawn(async move {
                    monitor.run(shutdown).await;
                }));
            }
            // Periodic push; `went_online` edges also trigger one directly
            // (wired in the engine via `monitor.subscribe`).
            {
                let service = Arc::clone(&service);
                let interval = config.connectivity_check_interval();
                let mut shutdown = shutdown_rx.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            return;
                        }
                        if let Err(e) = service.push().await {
                            warn!(error = %e, "scheduled push failed");
                        }
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                }));
            }
        }

        // Media mirror loop (replica side, when configured).
        if let Some(media) = media {
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                media.run(shutdown).await;
            }));
        }

        // Housekeeping: retention cleanup, ack pruning, staleness sweeps.
        {
            let retention_days = config.retention_days;
            let stale_after = config.ship_stale_after();
            let mut shutdown = shutdown_rx;
            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        return;
                    }
                    if let Err(e) = tracker.cleanup(retention_days) {
                        debug!(error = %e, "retention cleanup failed");
                    }
                    if let Err(e) = queue.prune_sent(Duration::from_secs(
                        u64::from(retention_days) * 24 * 3600,
                    )) {
                        debug!(error = %e, "queue prune failed");
                    }
                    if let Some(ships) = &ships {
                        if let Err(e) = ships.mark_stale(stale_after) {
                            debug!(error = %e, "staleness sweep failed");
                        }
                    }
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(HOUSEKEEPING_TICK) => {}
                    }
                }
            }));
        }

        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signal shutdown and wait for every loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task panicked");
            }
        }
    }
}
