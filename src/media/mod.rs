//! Blob mirroring: origin object store → local read-through cache.

pub mod mirror;
pub mod store;

pub use mirror::{MediaMirror, MediaStats};
pub use store::{BlobMeta, BlobStore, FsBlobStore, MemoryBlobStore};
