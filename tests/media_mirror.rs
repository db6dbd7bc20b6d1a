//! Media mirror resume behavior against a real cache directory.

use std::sync::Arc;
use std::time::Duration;

use shipsync::media::{BlobStore, FsBlobStore, MediaMirror, MemoryBlobStore};

#[tokio::test]
async fn interrupted_mirror_resumes_where_it_left_off() {
    let origin = MemoryBlobStore::new();
    for i in 0..100 {
        origin.insert(&format!("asset-{i:03}.bin"), vec![i as u8; 1024], &format!("etag-{i}"));
    }
    // 40 transfers fail mid-cycle (link drop).
    for i in 60..100 {
        origin.poison(&format!("asset-{i:03}.bin"));
    }

    let cache_dir = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(FsBlobStore::new(cache_dir.path()));
    let mirror = MediaMirror::new(
        Arc::clone(&origin) as Arc<dyn BlobStore>,
        Arc::clone(&cache) as Arc<dyn BlobStore>,
        Duration::from_secs(300),
        8,
    );

    let first = mirror.sync_once().await.expect("first cycle");
    assert_eq!(first.files_downloaded, 60);
    assert_eq!(first.files_failed, 40);
    assert_eq!(first.total_bytes, 60 * 1024);

    // Next cycle copies only the remainder; the rest is skipped by etag.
    let second = mirror.sync_once().await.expect("second cycle");
    assert_eq!(second.files_skipped, 60);
    assert_eq!(second.files_downloaded, 40);
    assert_eq!(second.files_failed, 0);
    assert_eq!(second.total_bytes, 100 * 1024);

    // Every object made it, none left as a partial download.
    let cached = cache.list().await.expect("list");
    assert_eq!(cached.len(), 100);
    for i in 0..100u32 {
        assert!(!cache.has_partial(&format!("asset-{i:03}.bin")).await);
    }
}

#[tokio::test]
async fn content_changes_propagate_by_etag() {
    let origin = MemoryBlobStore::new();
    origin.insert("logo.png", vec![1, 2, 3], "v1");

    let cache_dir = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(FsBlobStore::new(cache_dir.path()));
    let mirror = MediaMirror::new(
        Arc::clone(&origin) as Arc<dyn BlobStore>,
        Arc::clone(&cache) as Arc<dyn BlobStore>,
        Duration::from_secs(300),
        8,
    );

    mirror.sync_once().await.expect("first");
    origin.insert("logo.png", vec![9, 9, 9, 9], "v2");
    let stats = mirror.sync_once().await.expect("second");
    assert_eq!(stats.files_downloaded, 1);
    assert_eq!(cache.get("logo.png").await.expect("cached"), vec![9, 9, 9, 9]);
}
