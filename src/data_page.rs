//! Data pages: an append-only slot directory growing from the header end, and an append-only
//! record arena growing from the tail end, joined by a singly-linked overflow chain.
//!
//! The slot count only ever grows: slots are never shifted or deleted in place, only marked
//! (moved, deleted). That invariant is what lets the directory and the arena each bump-allocate
//! from their own end of the page without any compaction pass.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::epoch::Xid;
use crate::page::{DualPagePointer, PageHeader, PageKind, PageVersion, PAGE_SIZE};

/// A single slot in the directory: the record's XID, its location/capacity in the arena, and
/// cached lengths/fingerprint for cheap filtering without touching the arena.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Slot {
    pub xid: u64,
    pub record_offset: u32,
    pub record_capacity: u32,
    pub key_len: u16,
    pub value_len: u16,
    pub fingerprint: u16,
    pub moved: u8,
    _pad: u8,
}

const SLOT_SIZE: usize = std::mem::size_of::<Slot>();

impl Slot {
    pub fn is_moved(&self) -> bool {
        self.moved != 0 || Xid::from_raw(self.xid).is_moved()
    }
}

/// Fixed header fields preceding the slot directory: the common page header, the seqlock page
/// version (manipulated through a raw pointer, see [`HashDataPage::page_version`]), the bin
/// this page (or overflow chain) serves, the overflow link, and the two bump cursors.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct DataPageHeader {
    common: PageHeader,
    page_version_word: u64,
    bin: u64,
    next_page: DualPagePointer,
    slot_count: u32,
    arena_tail: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<DataPageHeader>();

/// Maximum slots a page can hold before every byte between the directory and the arena is
/// exhausted, assuming zero record bytes — an upper bound used for capacity checks.
pub const MAX_SLOTS: usize = (PAGE_SIZE - HEADER_SIZE) / SLOT_SIZE;

/// Raw view over one data page's bytes. All accessors take the backing buffer's base pointer;
/// callers (via `thread_context`/`location`) own the page's lifetime through the NUMA pool.
pub struct HashDataPage {
    base: *mut u8,
}

impl HashDataPage {
    /// # Safety
    /// `ptr` must point to a writable region at least [`PAGE_SIZE`] bytes long, exclusively
    /// owned by the caller for the duration of this call.
    pub unsafe fn init(ptr: *mut u8, storage_id: u64, bin: u64) {
        let header = ptr as *mut DataPageHeader;
        std::ptr::write(
            header,
            DataPageHeader {
                common: PageHeader::new(PageKind::HashData, storage_id),
                page_version_word: 0,
                bin,
                next_page: DualPagePointer::NULL,
                slot_count: 0,
                arena_tail: PAGE_SIZE as u32,
            },
        );
    }

    /// # Safety
    /// `ptr` must point to a page previously initialized via [`Self::init`], valid for as long
    /// as the returned view is used.
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        HashDataPage { base: ptr }
    }

    fn header(&self) -> &DataPageHeader {
        unsafe { &*(self.base as *const DataPageHeader) }
    }

    pub fn bin(&self) -> u64 {
        self.header().bin
    }

    pub fn storage_id(&self) -> u64 {
        self.header().common.storage_id
    }

    pub fn next_page(&self) -> DualPagePointer {
        self.header().next_page
    }

    /// Install the overflow chain's next-page pointer via CAS, returning the pointer that ended
    /// up installed.
    pub fn install_next_page(&self, candidate: DualPagePointer) -> DualPagePointer {
        // Overflow chains are volatile-only, so it's enough to CAS the low (volatile_offset)
        // word of `next_page` rather than the full `DualPagePointer`.
        let low = unsafe {
            &*(std::ptr::addr_of!((*(self.base as *const DataPageHeader)).next_page)
                as *const AtomicU32)
        };
        match low.compare_exchange(
            0,
            candidate.volatile_offset.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => candidate,
            Err(existing) => {
                DualPagePointer::new(crate::page::PageOffset(existing), 0)
            }
        }
    }

    /// A [`PageVersion`] view over this page's seqlock word.
    pub fn page_version(&self) -> &PageVersion {
        unsafe { &*(std::ptr::addr_of!(self.header().page_version_word) as *const PageVersion) }
    }

    fn slot_count_atomic(&self) -> &AtomicU32 {
        unsafe { &*(std::ptr::addr_of!(self.header().slot_count) as *const AtomicU32) }
    }

    fn arena_tail_atomic(&self) -> &AtomicU32 {
        unsafe { &*(std::ptr::addr_of!(self.header().arena_tail) as *const AtomicU32) }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count_atomic().load(Ordering::Acquire) as usize
    }

    fn slot_ptr(&self, index: usize) -> *mut Slot {
        debug_assert!(index < MAX_SLOTS);
        unsafe { (self.base.add(HEADER_SIZE) as *mut Slot).add(index) }
    }

    pub fn slot(&self, index: usize) -> &Slot {
        unsafe { &*self.slot_ptr(index) }
    }

    fn slot_atomic_xid(&self, index: usize) -> &AtomicU64 {
        unsafe { &*(std::ptr::addr_of!((*self.slot_ptr(index)).xid) as *const AtomicU64) }
    }

    pub fn load_xid(&self, index: usize) -> Xid {
        Xid::from_raw(self.slot_atomic_xid(index).load(Ordering::Acquire))
    }

    pub fn compare_exchange_xid(
        &self,
        index: usize,
        current: Xid,
        new: Xid,
    ) -> std::result::Result<Xid, Xid> {
        self.slot_atomic_xid(index)
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(Xid::from_raw)
            .map_err(Xid::from_raw)
    }

    fn record_bytes(&self, offset: u32, len: u16) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.add(offset as usize), len as usize) }
    }

    /// Split a slot's record bytes into `(key, value)`.
    pub fn record(&self, index: usize) -> (&[u8], &[u8]) {
        let slot = self.slot(index);
        let bytes = self.record_bytes(slot.record_offset, slot.key_len + slot.value_len);
        bytes.split_at(slot.key_len as usize)
    }

    /// Overwrite the value portion of an already-placed record in place, under the page-version
    /// write lock, used by `overwrite_record`. Requires the new value to be no longer than the
    /// slot's reserved capacity for the value region.
    pub fn overwrite_value_in_place(&self, index: usize, value: &[u8]) -> bool {
        let slot = self.slot(index);
        if value.len() != slot.value_len as usize {
            return false;
        }
        let dst = unsafe {
            self.base
                .add(slot.record_offset as usize + slot.key_len as usize)
        };
        unsafe { std::ptr::copy_nonoverlapping(value.as_ptr(), dst, value.len()) };
        true
    }

    /// Bytes remaining between the end of the slot directory and the start of the arena.
    fn free_bytes(&self) -> usize {
        let dir_end = HEADER_SIZE + self.slot_count() * SLOT_SIZE;
        let arena_start = self.arena_tail_atomic().load(Ordering::Acquire) as usize;
        arena_start.saturating_sub(dir_end)
    }

    pub fn has_room_for(&self, key_len: usize, value_len: usize) -> bool {
        self.free_bytes() >= SLOT_SIZE + key_len + value_len
    }

    /// Append a brand-new slot and its record bytes, returning the new slot's index. Caller
    /// must hold the page-version write lock.
    pub fn append_record(&self, xid: Xid, fingerprint: u16, key: &[u8], value: &[u8]) -> Option<usize> {
        let needed = key.len() + value.len();
        if !self.has_room_for(key.len(), value.len()) {
            return None;
        }
        let new_tail = self.arena_tail_atomic().load(Ordering::Relaxed) - needed as u32;
        let dst = unsafe { self.base.add(new_tail as usize) };
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), dst, key.len());
            std::ptr::copy_nonoverlapping(value.as_ptr(), dst.add(key.len()), value.len());
        }
        self.arena_tail_atomic().store(new_tail, Ordering::Release);

        let index = self.slot_count_atomic().load(Ordering::Relaxed) as usize;
        let slot = Slot {
            xid: xid.raw(),
            record_offset: new_tail,
            record_capacity: needed as u32,
            key_len: key.len() as u16,
            value_len: value.len() as u16,
            fingerprint,
            moved: 0,
            _pad: 0,
        };
        unsafe { std::ptr::write(self.slot_ptr(index), slot) };
        self.slot_count_atomic()
            .store(index as u32 + 1, Ordering::Release);
        Some(index)
    }

    /// Mark a slot as logically moved (its record now lives at `successor_bin`'s tail page,
    /// found by re-running `locate_bin`/`locate_record`). Caller must hold the page-version
    /// write lock and have already installed the successor slot, per the lock order documented
    /// in `location.rs::migrate_record`.
    pub fn mark_moved(&self, index: usize) {
        let slot = unsafe { &mut *self.slot_ptr(index) };
        slot.moved = 1;
        let atomic = self.slot_atomic_xid(index);
        let current = atomic.load(Ordering::Acquire);
        atomic.store(Xid::from_raw(current).with_moved(true).raw(), Ordering::Release);
    }
}

// Safety: all mutation through `HashDataPage` goes through atomics or is guarded by the
// page-version write lock at the call site (`location.rs`).
unsafe impl Send for HashDataPage {}
unsafe impl Sync for HashDataPage {}
