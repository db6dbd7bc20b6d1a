//! Blob store seam for the media mirror.
//!
//! The origin object store is external (its SDK lives with the host); the
//! engine sees both sides through [`BlobStore`]. The filesystem
//! implementation backs the local read-through cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Result, SyncError};

/// Identity of one stored object; `etag` changes whenever content does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list(&self) -> Result<Vec<BlobMeta>>;
    async fn stat(&self, key: &str) -> Result<Option<BlobMeta>>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn put(&self, key: &str, bytes: &[u8], etag: &str) -> Result<()>;
}

// ============================================================================
// FsBlobStore — local cache directory
// ============================================================================

/// Filesystem-backed store. Content lands in `<root>/<key>`; the source
/// etag is kept in a `<key>.etag` sidecar. Writes go to a `.tmp` path and
/// rename into place, so a torn download never shadows a good object.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        // Keys are opaque names, not paths; refuse anything that escapes.
        if key.is_empty() || key.contains("..") || key.starts_with('/') {
            return Err(SyncError::Storage(format!("invalid blob key {key:?}")));
        }
        Ok(self.root.join(key))
    }

    // Suffixes are appended (not swapped in) so `a.bin` and `a.txt` keep
    // distinct sidecars.
    fn etag_path(&self, key: &str) -> Result<PathBuf> {
        self.object_path(key)
            .map(|p| p.with_file_name(format!("{key}.etag")))
    }

    fn tmp_path(&self, key: &str) -> Result<PathBuf> {
        self.object_path(key)
            .map(|p| p.with_file_name(format!("{key}.tmp")))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self) -> Result<Vec<BlobMeta>> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".etag") || name.ends_with(".tmp") {
                continue;
            }
            if let Some(meta) = self.stat(name).await? {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn stat(&self, key: &str) -> Result<Option<BlobMeta>> {
        let path = self.object_path(key)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let etag = tokio::fs::read_to_string(self.etag_path(key)?)
            .await
            .unwrap_or_default();
        Ok(Some(BlobMeta {
            key: key.to_string(),
            size: meta.len(),
            etag,
        }))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.object_path(key)?).await?)
    }

    async fn put(&self, key: &str, bytes: &[u8], etag: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.tmp_path(key)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tokio::fs::write(self.etag_path(key)?, etag).await?;
        Ok(())
    }
}

impl FsBlobStore {
    /// Whether a partial download is currently on disk (test hook).
    pub async fn has_partial(&self, key: &str) -> bool {
        match self.tmp_path(key) {
            Ok(path) => tokio::fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

// ============================================================================
// MemoryBlobStore — origin stand-in for tests
// ============================================================================

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, String)>>,
    /// Keys whose next `get` fails (scripted transfer faults).
    poisoned: RwLock<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>, etag: &str) {
        self.objects
            .write()
            .insert(key.to_string(), (bytes, etag.to_string()));
    }

    pub fn poison(&self, key: &str) {
        self.poisoned.write().push(key.to_string());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self) -> Result<Vec<BlobMeta>> {
        Ok(self
            .objects
            .read()
            .iter()
            .map(|(key, (bytes, etag))| BlobMeta {
                key: key.clone(),
                size: bytes.len() as u64,
                etag: etag.clone(),
            })
            .collect())
    }

    async fn stat(&self, key: &str) -> Result<Option<BlobMeta>> {
        Ok(self.objects.read().get(key).map(|(bytes, etag)| BlobMeta {
            key: key.to_string(),
            size: bytes.len() as u64,
            etag: etag.clone(),
        }))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        {
            let mut poisoned = self.poisoned.write();
            if let Some(pos) = poisoned.iter().position(|k| k == key) {
                poisoned.remove(pos);
                return Err(SyncError::TransientNetwork(format!(
                    "simulated transfer failure for {key}"
                )));
            }
        }
        self.objects
            .read()
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| SyncError::Storage(format!("no such object {key}")))
    }

    async fn put(&self, key: &str, bytes: &[u8], etag: &str) -> Result<()> {
        self.insert(key, bytes.to_vec(), etag);
        Ok(())
    }
}
