//! Storage registry: monotonic id issuance and a resizable, lock-free-to-read array of storage
//! control blocks.
//!
//! Reads go through an `arc_swap::ArcSwap` snapshot instead of hand-rolled acquire/release
//! fences around a raw pointer array, so growth and registration can be serialized by a single
//! mutex while readers never block.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::control_block::{HashStorageControlBlock, StorageId};
use crate::error::{CoreError, ErrorCode, Result};

type Slots = Vec<Option<Arc<HashStorageControlBlock>>>;

/// Registry of live storages, indexed by [`StorageId`]. Reads go through an [`ArcSwap`] snapshot
/// (acquire-equivalent); growth and registration are serialized by a mutex.
pub struct StorageRegistry {
    next_id: AtomicU32,
    slots: ArcSwap<Slots>,
    grow_lock: Mutex<()>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        StorageRegistry {
            next_id: AtomicU32::new(1),
            slots: ArcSwap::from_pointee(Vec::new()),
            grow_lock: Mutex::new(()),
        }
    }

    /// A simple fetch-and-increment; ids start at 1 (0 is reserved to mean "no storage").
    pub fn issue_next_storage_id(&self) -> StorageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Double-plus-one growth: `new_size = old_size * 2 + 1`.
    fn ensure_capacity(&self, min_len: usize) {
        let _guard = self.grow_lock.lock();
        let current = self.slots.load();
        if current.len() >= min_len {
            return;
        }
        let mut new_size = current.len().max(1);
        while new_size < min_len {
            new_size = new_size * 2 + 1;
        }
        let mut next: Slots = Vec::with_capacity(new_size);
        next.extend(current.iter().cloned());
        next.resize_with(new_size, || None);
        self.slots.store(Arc::new(next));
    }

    /// Register a new storage control block under its own id. Rejects an id already occupied.
    pub fn register_storage(&self, storage: Arc<HashStorageControlBlock>) -> Result<()> {
        let id = storage.id as usize;
        self.ensure_capacity(id + 1);
        let _guard = self.grow_lock.lock();
        let current = self.slots.load();
        if current.get(id).and_then(|s| s.as_ref()).is_some() {
            return Err(CoreError::from(ErrorCode::StorageDuplicateId)
                .context("StorageRegistry::register_storage"));
        }
        let mut next: Slots = (**current).clone();
        next[id] = Some(storage);
        self.slots.store(Arc::new(next));
        Ok(())
    }

    /// An acquire-fenced read by id, returning `None` for an unoccupied or out-of-range id.
    pub fn get_storage(&self, id: StorageId) -> Option<Arc<HashStorageControlBlock>> {
        self.slots.load().get(id as usize).and_then(|s| s.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<HashStorageControlBlock>> {
        self.slots
            .load()
            .iter()
            .flatten()
            .find(|s| s.name == name)
            .cloned()
    }

    /// Clear the slot, leaving the id permanently retired (ids are never reused).
    pub fn remove_storage(&self, id: StorageId) {
        let _guard = self.grow_lock.lock();
        let current = self.slots.load();
        if (id as usize) >= current.len() {
            return;
        }
        let mut next: Slots = (**current).clone();
        next[id as usize] = None;
        self.slots.store(Arc::new(next));
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_combo::HashMetadata;

    fn block(id: StorageId, name: &str) -> Arc<HashStorageControlBlock> {
        Arc::new(HashStorageControlBlock::new(
            id,
            name.to_string(),
            HashMetadata::new(4),
            1,
        ))
    }

    #[test]
    fn issue_next_storage_id_is_monotonic() {
        let registry = StorageRegistry::new();
        let a = registry.issue_next_storage_id();
        let b = registry.issue_next_storage_id();
        assert!(b > a);
    }

    #[test]
    fn register_and_get_round_trip() {
        let registry = StorageRegistry::new();
        let id = registry.issue_next_storage_id();
        registry.register_storage(block(id, "widgets")).unwrap();
        let fetched = registry.get_storage(id).unwrap();
        assert_eq!(fetched.name, "widgets");
        assert_eq!(registry.find_by_name("widgets").unwrap().id, id);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = StorageRegistry::new();
        let id = registry.issue_next_storage_id();
        registry.register_storage(block(id, "a")).unwrap();
        let err = registry.register_storage(block(id, "b")).unwrap_err();
        assert!(err.is(ErrorCode::StorageDuplicateId));
    }

    #[test]
    fn remove_storage_clears_slot() {
        let registry = StorageRegistry::new();
        let id = registry.issue_next_storage_id();
        registry.register_storage(block(id, "a")).unwrap();
        registry.remove_storage(id);
        assert!(registry.get_storage(id).is_none());
    }
}
