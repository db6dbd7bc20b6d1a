//! Per-document advisory locks.
//!
//! Inbound applies (and the conflict resolver's version read) serialize per
//! document by acquiring the lock keyed by `hash(contentType ‖ documentId)`
//! for the duration of the transaction. Different documents apply in
//! parallel; this is the only in-process lock besides the connection mutex.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of live document locks. Entries are dropped once no task holds
/// or awaits them.
#[derive(Default)]
pub struct DocumentLocks {
    slots: Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of one apply. Dropping releases the document.
pub struct DocumentGuard {
    _guard: OwnedMutexGuard<()>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the advisory lock for `(content_type, document_id)`.
    pub async fn acquire(&self, content_type: &str, document_id: &str) -> DocumentGuard {
        let key = lock_key(content_type, document_id);
        let slot = {
            let mut slots = self.slots.lock();
            // Opportunistically drop released slots so the map stays small.
            slots.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(slots.entry(key).or_default())
        };
        DocumentGuard {
            _guard: slot.lock_owned().await,
        }
    }

    #[cfg(test)]
    fn live_slots(&self) -> usize {
        let mut slots = self.slots.lock();
        slots.retain(|_, m| Arc::strong_count(m) > 1);
        slots.len()
    }
}

fn lock_key(content_type: &str, document_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content_type.hash(&mut hasher);
    0xffu8.hash(&mut hasher);
    document_id.hash(&mut hasher);
    hasher.finish()
}
