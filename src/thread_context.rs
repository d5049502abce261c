//! Per-worker transaction context: the local page-allocation chunk plus the read/write/pointer/
//! page-version sets validated at commit.
//!
//! Every successful physical lookup registers into one of these sets before returning, so
//! commit-time validation can detect a concurrent writer or page mutation without re-walking
//! the tree.

use std::sync::Arc;

use crate::epoch::Xid;
use crate::numa::{NumaNodePool, PagePoolOffsetChunk, Population};
use crate::page::{DualPagePointer, PageOffset};

/// A precise reference to one record: which page (by offset) and which slot index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub page_offset: PageOffset,
    pub slot_index: usize,
}

/// An observed-but-not-yet-written record, recorded so commit-time validation can detect a
/// concurrent writer slipped in underneath a reader.
#[derive(Debug, Clone, Copy)]
pub struct ReadAccess {
    pub slot: SlotRef,
    pub observed_xid: Xid,
}

/// A record this transaction intends to write, recorded so commit can install the new XID.
#[derive(Debug, Clone, Copy)]
pub struct WriteAccess {
    pub slot: SlotRef,
}

/// An observed page-pointer read (e.g. following a null intermediate-page child), recorded so
/// commit can detect the pointer was concurrently materialized.
#[derive(Debug, Clone, Copy)]
pub struct PointerAccess {
    pub observed: DualPagePointer,
}

/// An observed page-version seqlock sample, recorded so commit can detect the page was
/// concurrently mutated (a slot moved, an overflow page linked in) even if the specific slot
/// this transaction read wasn't itself touched.
#[derive(Debug, Clone, Copy)]
pub struct PageVersionAccess {
    pub page_offset: PageOffset,
    pub observed: u64,
}

/// Per-worker state: one local page-allocation chunk per NUMA node it has touched, plus the
/// four access sets accumulated over the lifetime of the current transaction.
pub struct ThreadContext {
    pub worker_id: u32,
    pub home_node: Arc<NumaNodePool>,
    chunk: PagePoolOffsetChunk,
    pub read_set: Vec<ReadAccess>,
    pub write_set: Vec<WriteAccess>,
    pub pointer_set: Vec<PointerAccess>,
    pub page_version_set: Vec<PageVersionAccess>,
}

impl ThreadContext {
    pub fn new(worker_id: u32, home_node: Arc<NumaNodePool>) -> Self {
        let chunk = PagePoolOffsetChunk::new(home_node.clone(), Population::Volatile);
        ThreadContext {
            worker_id,
            home_node,
            chunk,
            read_set: Vec::new(),
            write_set: Vec::new(),
            pointer_set: Vec::new(),
            page_version_set: Vec::new(),
        }
    }

    pub fn allocate_page(&mut self) -> crate::error::Result<PageOffset> {
        self.chunk.allocate()
    }

    pub fn release_page(&mut self, offset: PageOffset) {
        self.chunk.release(offset);
    }

    pub fn page_ptr(&self, offset: PageOffset) -> *mut u8 {
        self.chunk.page_ptr(offset)
    }

    pub fn record_read(&mut self, slot: SlotRef, observed_xid: Xid) {
        self.read_set.push(ReadAccess { slot, observed_xid });
    }

    pub fn record_write(&mut self, slot: SlotRef) {
        self.write_set.push(WriteAccess { slot });
    }

    pub fn record_pointer(&mut self, observed: DualPagePointer) {
        self.pointer_set.push(PointerAccess { observed });
    }

    pub fn record_page_version(&mut self, page_offset: PageOffset, observed: u64) {
        self.page_version_set
            .push(PageVersionAccess { page_offset, observed });
    }

    /// Clear all access sets, called after commit or abort.
    pub fn clear_sets(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
        self.pointer_set.clear();
        self.page_version_set.clear();
    }
}
