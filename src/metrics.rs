//! Prometheus exposition for the status surface.
//!
//! Gauges are refreshed from the stores at scrape time, so the registry
//! never drifts from the database it describes.

use std::time::Instant;

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::{Result, SyncError};
use crate::store::dead_letter::DeadLetterStats;
use crate::store::processed::TrackerStats;

/// Point-in-time values gathered from the stores before a scrape.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub messages: TrackerStats,
    pub ships_total: u64,
    pub ships_online: u64,
    pub queue_pending: u64,
    pub dead_letters: DeadLetterStats,
}

pub struct SyncMetrics {
    registry: Registry,
    uptime_seconds: IntGauge,
    messages_total: IntGaugeVec,
    ships_total: IntGauge,
    ships_online: IntGauge,
    queue_pending: IntGauge,
    dead_letter_total: IntGaugeVec,
    started_at: Instant,
}

fn metrics_err(e: prometheus::Error) -> SyncError {
    SyncError::Storage(format!("metrics registry: {e}"))
}

impl SyncMetrics {
    pub fn new(mode: &str, ship_id: Option<&str>) -> Result<Self> {
        let registry = Registry::new();

        let info = IntGaugeVec::new(
            Opts::new("offline_sync_info", "Static engine identity"),
            &["mode", "ship_id"],
        )
        .map_err(metrics_err)?;
        let uptime_seconds = IntGauge::new(
            "offline_sync_uptime_seconds",
            "Seconds since the engine started",
        )
        .map_err(metrics_err)?;
        let messages_total = IntGaugeVec::new(
            Opts::new("offline_sync_messages_total", "Processed-message ledger by status"),
            &["status"],
        )
        .map_err(metrics_err)?;
        let ships_total =
            IntGauge::new("offline_sync_ships_total", "Known replicas").map_err(metrics_err)?;
        let ships_online = IntGauge::new("offline_sync_ships_online", "Replicas currently online")
            .map_err(metrics_err)?;
        let queue_pending = IntGauge::new(
            "offline_sync_queue_pending",
            "Outbound queue entries awaiting dispatch",
        )
        .map_err(metrics_err)?;
        let dead_letter_total = IntGaugeVec::new(
            Opts::new("offline_sync_dead_letter_total", "Dead-letter entries by status"),
            &["status"],
        )
        .map_err(metrics_err)?;

        registry.register(Box::new(info.clone())).map_err(metrics_err)?;
        registry
            .register(Box::new(uptime_seconds.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(messages_total.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(ships_total.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(ships_online.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(queue_pending.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(dead_letter_total.clone()))
            .map_err(metrics_err)?;

        // The info series is constant; the registry keeps it alive.
        info.with_label_values(&[mode, ship_id.unwrap_or("")]).set(1);

        Ok(Self {
            registry,
            uptime_seconds,
            messages_total,
            ships_total,
            ships_online,
            queue_pending,
            dead_letter_total,
            started_at: Instant::now(),
        })
    }

    /// Refresh every series from `snapshot` and render the exposition text.
    pub fn render(&self, snapshot: &MetricsSnapshot) -> Result<String> {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);
        self.messages_total
            .with_label_values(&["processed"])
            .set(snapshot.messages.processed as i64);
        self.messages_total
            .with_label_values(&["failed"])
            .set(snapshot.messages.failed as i64);
        self.ships_total.set(snapshot.ships_total as i64);
        self.ships_online.set(snapshot.ships_online as i64);
        self.queue_pending.set(snapshot.queue_pending as i64);
        for (status, value) in [
            ("pending", snapshot.dead_letters.pending),
            ("retrying", snapshot.dead_letters.retrying),
            ("exhausted", snapshot.dead_letters.exhausted),
            ("resolved", snapshot.dead_letters.resolved),
        ] {
            self.dead_letter_total
                .with_label_values(&[status])
                .set(value as i64);
        }

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metrics_err)?;
        String::from_utf8(buf).map_err(|e| SyncError::Storage(format!("metrics encoding: {e}")))
    }
}
