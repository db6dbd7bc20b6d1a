//! Media mirror: origin blob store → local cache, on a recurring schedule.
//!
//! Each cycle lists the origin and copies every object that is missing
//! locally or whose etag differs, up to the configured number of in-flight
//! transfers. A failed transfer is retried on the next cycle; the cache
//! store writes through a `.tmp` rename, so interrupted copies never count
//! as mirrored.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::error::Result;

use super::store::BlobStore;

/// Progress counters exposed through the media health endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStats {
    pub files_downloaded: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub total_bytes: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub error: Option<String>,
}

pub struct MediaMirror {
    origin: Arc<dyn BlobStore>,
    cache: Arc<dyn BlobStore>,
    interval: Duration,
    concurrency: usize,
    stats: Mutex<MediaStats>,
}

impl MediaMirror {
    pub fn new(
        origin: Arc<dyn BlobStore>,
        cache: Arc<dyn BlobStore>,
        interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            origin,
            cache,
            interval,
            concurrency: concurrency.max(1),
            stats: Mutex::new(MediaStats::default()),
        }
    }

    pub fn stats(&self) -> MediaStats {
        self.stats.lock().clone()
    }

    /// One full mirror pass. Counters reflect this cycle; `total_bytes`
    /// accumulates across cycles.
    pub async fn sync_once(&self) -> Result<MediaStats> {
        {
            let mut stats = self.stats.lock();
            if stats.is_running {
                debug!("media sync already running; skipping overlapping cycle");
                return Ok(stats.clone());
            }
            stats.is_running = true;
            stats.files_downloaded = 0;
            stats.files_skipped = 0;
            stats.files_failed = 0;
            stats.error = None;
        }

        let outcome = self.mirror_all().await;

        let mut stats = self.stats.lock();
        stats.is_running = false;
        stats.last_sync_at = Some(Utc::now());
        if let Err(e) = &outcome {
            stats.error = Some(e.to_string());
        }
        info!(
            downloaded = stats.files_downloaded,
            skipped = stats.files_skipped,
            failed = stats.files_failed,
            "media sync cycle finished"
        );
        Ok(stats.clone())
    }

    async fn mirror_all(&self) -> Result<()> {
        let origin_objects = self.origin.list().await?;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::new();

        for meta in origin_objects {
            // Cheap diff first: identical etag and size means up to date.
            match self.cache.stat(&meta.key).await? {
                Some(cached) if cached.etag == meta.etag && cached.size == meta.size => {
                    self.stats.lock().files_skipped += 1;
                    continue;
                }
                _ => {}
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let origin = Arc::clone(&self.origin);
            let cache = Arc::clone(&self.cache);
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let bytes = origin.get(&meta.key).await?;
                cache.put(&meta.key, &bytes, &meta.etag).await?;
                Ok::<u64, crate::error::SyncError>(bytes.len() as u64)
            }));
        }

        for task in tasks {
            match task.await {
                Ok(Ok(bytes)) => {
                    let mut stats = self.stats.lock();
                    stats.files_downloaded += 1;
                    stats.total_bytes += bytes;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "media transfer failed; will retry next cycle");
                    self.stats.lock().files_failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "media transfer task panicked");
                    self.stats.lock().files_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Recurring mirror loop; exits when shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = self.sync_once().await {
                warn!(error = %e, "media sync cycle failed");
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
