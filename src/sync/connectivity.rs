//! Link-health monitoring (replica side).
//!
//! Probes the bus on a timer and on demand, tracks the current state, and
//! fires edge events. The sync service subscribes and drains the outbound
//! queue the moment the link comes back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::transport::BusProducer;

/// Probe deadline; a probe slower than this counts as offline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one connectivity check.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkProbe {
    pub is_online: bool,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Edge event fired when the observed state flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    WentOnline,
    WentOffline,
}

pub type LinkListener = Arc<dyn Fn(LinkEvent) + Send + Sync>;

pub struct ConnectivityMonitor {
    producer: Arc<dyn BusProducer>,
    interval: Duration,
    online: AtomicBool,
    last_probe: Mutex<Option<LinkProbe>>,
    listeners: Mutex<Vec<LinkListener>>,
}

impl ConnectivityMonitor {
    /// Starts pessimistic: offline until the first successful probe, so the
    /// first good check fires `WentOnline` and triggers a drain.
    pub fn new(producer: Arc<dyn BusProducer>, interval: Duration) -> Self {
        Self {
            producer,
            interval,
            online: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: LinkListener) {
        self.listeners.lock().push(listener);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn last_probe(&self) -> Option<LinkProbe> {
        self.last_probe.lock().clone()
    }

    /// Probe the link now and fire an edge event if the state flipped.
    pub async fn check_connectivity(&self) -> LinkProbe {
        let probe = match tokio::time::timeout(PROBE_TIMEOUT, self.producer.ping()).await {
            Ok(Ok(latency)) => LinkProbe {
                is_online: true,
                latency_ms: Some(latency.as_millis() as u64),
                reason: None,
            },
            Ok(Err(e)) => LinkProbe {
                is_online: false,
                latency_ms: None,
                reason: Some(e.message),
            },
            Err(_) => LinkProbe {
                is_online: false,
                latency_ms: None,
                reason: Some(format!("probe timed out after {PROBE_TIMEOUT:?}")),
            },
        };

        let was_online = self.online.swap(probe.is_online, Ordering::SeqCst);
        *self.last_probe.lock() = Some(probe.clone());

        if was_online != probe.is_online {
            let event = if probe.is_online {
                LinkEvent::WentOnline
            } else {
                LinkEvent::WentOffline
            };
            info!(online = probe.is_online, "connectivity changed");
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                listener(event);
            }
        } else {
            debug!(online = probe.is_online, "connectivity unchanged");
        }
        probe
    }

    /// Periodic probe loop; exits when shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            self.check_connectivity().await;
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBus;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn edges_fire_only_on_transitions() {
        let bus = MemoryBus::new();
        let monitor = ConnectivityMonitor::new(
            Arc::clone(&bus) as Arc<dyn BusProducer>,
            Duration::from_secs(30),
        );

        let online_edges = Arc::new(AtomicUsize::new(0));
        let offline_edges = Arc::new(AtomicUsize::new(0));
        let on = Arc::clone(&online_edges);
        let off = Arc::clone(&offline_edges);
        monitor.subscribe(Arc::new(move |event| match event {
            LinkEvent::WentOnline => {
                on.fetch_add(1, Ordering::SeqCst);
            }
            LinkEvent::WentOffline => {
                off.fetch_add(1, Ordering::SeqCst);
            }
        }));

        // First good probe flips the pessimistic initial state.
        assert!(monitor.check_connectivity().await.is_online);
        assert!(monitor.check_connectivity().await.is_online);
        assert_eq!(online_edges.load(Ordering::SeqCst), 1);

        bus.set_offline(true);
        let probe = monitor.check_connectivity().await;
        assert!(!probe.is_online);
        assert!(probe.reason.is_some());
        assert_eq!(offline_edges.load(Ordering::SeqCst), 1);

        bus.set_offline(false);
        monitor.check_connectivity().await;
        assert_eq!(online_edges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn probe_reports_latency_when_online() {
        let bus = MemoryBus::new();
        let monitor = ConnectivityMonitor::new(
            Arc::clone(&bus) as Arc<dyn BusProducer>,
            Duration::from_secs(30),
        );
        let probe = monitor.check_connectivity().await;
        assert!(probe.is_online);
        assert!(probe.latency_ms.is_some());
        assert!(monitor.is_online());
        assert!(monitor.last_probe().expect("probe recorded").is_online);
    }
}
