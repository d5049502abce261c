//! Shared page primitives: offsets, dual pointers, page headers, and the seqlock-style
//! page-version word.
//!
//! Pages use a raw `#[repr(C)]` header read through an unsafe pointer view rather than a typed
//! struct with named fields throughout, so a page's on-disk/in-arena byte layout stays exactly
//! under our control. The page-version lock is a seqlock: even means unlocked, odd means
//! locked, and unlocking always leaves the counter strictly greater and even.

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

/// Fixed page size for both intermediate and data pages.
pub const PAGE_SIZE: usize = 4096;

/// An offset into a NUMA node's volatile page arena. Zero means null, matching
/// `DualPagePointer`'s null encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct PageOffset(pub u32);

impl PageOffset {
    pub const NULL: PageOffset = PageOffset(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A volatile/snapshot pointer pair. `snapshot_offset` addresses a page in the (non-goal, so
/// unused at runtime) snapshot store; it is still carried in the layout so the on-page slot size
/// intermediate pages are laid out against doesn't change if snapshot support is added later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DualPagePointer {
    pub volatile_offset: PageOffset,
    _pad: u32,
    pub snapshot_offset: u64,
}

impl DualPagePointer {
    pub const NULL: DualPagePointer = DualPagePointer {
        volatile_offset: PageOffset::NULL,
        _pad: 0,
        snapshot_offset: 0,
    };

    pub fn new(volatile_offset: PageOffset, snapshot_offset: u64) -> Self {
        DualPagePointer {
            volatile_offset,
            _pad: 0,
            snapshot_offset,
        }
    }

    pub fn is_null(self) -> bool {
        self.volatile_offset.is_null() && self.snapshot_offset == 0
    }
}

/// Tag distinguishing intermediate from data pages, stored in every page header so a raw
/// offset can be safely reinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    HashIntermediate = 1,
    HashData = 2,
}

/// Common page header present at the front of every page: a kind tag plus the owning storage
/// id, followed by whatever fields the concrete page kind needs after it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PageHeader {
    pub page_kind: u8,
    _reserved: [u8; 7],
    pub storage_id: u64,
}

impl PageHeader {
    pub fn new(kind: PageKind, storage_id: u64) -> Self {
        PageHeader {
            page_kind: kind as u8,
            _reserved: [0; 7],
            storage_id,
        }
    }

    pub fn kind(&self) -> Option<PageKind> {
        match self.page_kind {
            1 => Some(PageKind::HashIntermediate),
            2 => Some(PageKind::HashData),
            _ => None,
        }
    }
}

/// A seqlock-flavored page version counter. Even values mean unlocked; a writer CASes from an
/// even value to the next odd value to take the lock, mutates, then stores the next even value
/// (strictly greater, so readers who sampled the old even value detect the change).
#[derive(Debug, Default)]
pub struct PageVersion(AtomicU64);

impl PageVersion {
    pub const fn new() -> Self {
        PageVersion(AtomicU64::new(0))
    }

    /// Take a read-begin sample. Caller should retry the read if [`Self::validate_read`] fails.
    pub fn begin_read(&self) -> u64 {
        loop {
            let v = self.0.load(Ordering::Acquire);
            if v & 1 == 0 {
                return v;
            }
            std::hint::spin_loop();
        }
    }

    /// Returns true if no writer has taken the lock since `sampled`.
    pub fn validate_read(&self, sampled: u64) -> bool {
        self.0.load(Ordering::Acquire) == sampled
    }

    /// Acquire the write lock, spinning on CAS until the counter is observed even and
    /// successfully bumped to odd.
    pub fn lock(&self) -> PageVersionGuard<'_> {
        loop {
            let v = self.0.load(Ordering::Relaxed);
            if v & 1 == 0
                && self
                    .0
                    .compare_exchange_weak(v, v + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return PageVersionGuard { version: self };
            }
            std::hint::spin_loop();
        }
    }
}

/// RAII guard releasing a [`PageVersion`] write lock, bumping the counter to the next even
/// value on drop.
pub struct PageVersionGuard<'a> {
    version: &'a PageVersion,
}

impl Drop for PageVersionGuard<'_> {
    fn drop(&mut self) {
        let locked = self.version.0.load(Ordering::Relaxed);
        debug_assert!(locked & 1 == 1, "page version guard dropped while unlocked");
        self.version.0.store(locked + 1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_dual_pointer_is_zeroed() {
        assert!(DualPagePointer::NULL.is_null());
        assert!(DualPagePointer::default().is_null());
    }

    #[test]
    fn page_header_round_trips_kind() {
        let h = PageHeader::new(PageKind::HashData, 7);
        assert_eq!(h.kind(), Some(PageKind::HashData));
        assert_eq!(h.storage_id, 7);
    }

    #[test]
    fn page_version_read_validates_across_no_writes() {
        let v = PageVersion::new();
        let sample = v.begin_read();
        assert!(v.validate_read(sample));
    }

    #[test]
    fn page_version_write_lock_bumps_to_even_and_invalidates_readers() {
        let v = PageVersion::new();
        let sample = v.begin_read();
        {
            let _guard = v.lock();
        }
        assert!(!v.validate_read(sample));
        let new_sample = v.begin_read();
        assert!(v.validate_read(new_sample));
        assert_eq!(new_sample % 2, 0);
    }
}
