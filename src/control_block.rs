//! Per-storage control block: status, root pointer, and hash metadata.
//!
//! This crate is single-process shared-everything rather than backed by cross-process shared
//! memory, so the control block is an ordinary heap struct behind `Arc` (see DESIGN.md /
//! SPEC_FULL.md §9 for this resolved open question).

use parking_lot::Mutex;

use crate::hash_combo::HashMetadata;
use crate::intermediate_page::root_children;
use crate::page::DualPagePointer;

/// Storage lifecycle status (no "being dropped asynchronously" state since drop here is
/// synchronous).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    NotCreated,
    Created,
    Marked,
}

pub type StorageId = u32;

/// Per-storage shared state: status, name, root pointer, and the hash tree shape (bin bits,
/// bin count, intermediate levels).
pub struct HashStorageControlBlock {
    pub id: StorageId,
    pub name: String,
    status: Mutex<StorageStatus>,
    root_page_pointer: Mutex<DualPagePointer>,
    pub metadata: HashMetadata,
    pub levels: u8,
}

impl HashStorageControlBlock {
    pub fn new(id: StorageId, name: String, metadata: HashMetadata, levels: u8) -> Self {
        HashStorageControlBlock {
            id,
            name,
            status: Mutex::new(StorageStatus::NotCreated),
            root_page_pointer: Mutex::new(DualPagePointer::NULL),
            metadata,
            levels,
        }
    }

    pub fn status(&self) -> StorageStatus {
        *self.status.lock()
    }

    pub fn mark_created(&self, root: DualPagePointer) {
        let mut status = self.status.lock();
        *status = StorageStatus::Created;
        *self.root_page_pointer.lock() = root;
    }

    pub fn mark_dropped(&self) {
        *self.status.lock() = StorageStatus::Marked;
    }

    pub fn root_page_pointer(&self) -> DualPagePointer {
        *self.root_page_pointer.lock()
    }

    pub fn set_root_page_pointer(&self, ptr: DualPagePointer) {
        *self.root_page_pointer.lock() = ptr;
    }

    pub fn bin_count(&self) -> u64 {
        self.metadata.bin_count
    }

    /// How many direct children the root intermediate page needs to cover every bin, per
    /// `HashStorageControlBlock::get_root_children()`.
    pub fn root_children(&self) -> usize {
        root_children(self.bin_count(), self.levels)
    }
}
