//! Bin addressing and record location: walking the intermediate-page tree down to a bin's data
//! page chain, searching that chain for a record, and migrating a record whose reserved slot
//! capacity was outgrown.
//!
//! `locate_record` returns the current (non-moved) version of a key by default; `SearchMode`
//! switches it to a physical-only scan for callers (migration) that need to find a specific
//! slot regardless of its moved status.

use crate::control_block::HashStorageControlBlock;
use crate::data_page::HashDataPage;
use crate::epoch::{Epoch, Xid};
use crate::error::{CoreError, ErrorCode, Result, ResultExt};
use crate::hash_combo::HashCombo;
use crate::intermediate_page::{subtree_capacity, HashIntermediatePage, FAN_OUT};
use crate::page::{DualPagePointer, PageOffset};
use crate::thread_context::{SlotRef, ThreadContext};

/// Whether a record search should skip slots marked moved (the common case: callers want the
/// current version) or return the first physical match regardless (used while migrating, where
/// the caller is locating the slot *to* migrate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Logical,
    PhysicalOnly,
}

/// The outcome of a successful record location: which page/slot it lives in and the XID
/// observed at the moment of the search (for OCC validation at commit).
#[derive(Debug, Clone, Copy)]
pub struct RecordLocation {
    pub page_offset: PageOffset,
    pub slot_index: usize,
    pub observed_xid: Xid,
}

impl RecordLocation {
    pub fn slot_ref(&self) -> SlotRef {
        SlotRef {
            page_offset: self.page_offset,
            slot_index: self.slot_index,
        }
    }
}

fn data_page_at(ctx: &ThreadContext, offset: PageOffset) -> HashDataPage {
    unsafe { HashDataPage::from_raw(ctx.page_ptr(offset)) }
}

fn intermediate_page_at<'a>(ctx: &ThreadContext, offset: PageOffset) -> &'a HashIntermediatePage {
    unsafe { HashIntermediatePage::view(ctx.page_ptr(offset)) }
}

/// Walk the intermediate-page tree from the root down to the leaf intermediate page covering
/// `combo.bin`, materializing any null children along the path.
pub fn locate_bin(
    cb: &HashStorageControlBlock,
    ctx: &mut ThreadContext,
    combo: &HashCombo,
) -> Result<DualPagePointer> {
    let mut parent_ptr = cb.root_page_pointer();
    if parent_ptr.is_null() {
        return Err(CoreError::from(ErrorCode::DataCorruption)
            .context("locate_bin: storage has no root page"));
    }
    let mut bin = combo.bin;
    for lvl in 0..cb.levels {
        let depth_from_leaf = cb.levels - 1 - lvl;
        let per_child = subtree_capacity(depth_from_leaf);
        let index = (bin / per_child) as usize % FAN_OUT;
        bin %= per_child;
        let page = intermediate_page_at(ctx, parent_ptr.volatile_offset);
        ctx.record_pointer(parent_ptr);
        let child = follow_page(ctx, page, index, cb.id as u64, depth_from_leaf > 0)?;
        parent_ptr = child;
    }
    Ok(parent_ptr)
}

/// Return an intermediate page's child at `index`, materializing it if null. When `child_is_intermediate`
/// is false, the materialized page is the bin's first data page instead of another intermediate
/// page.
fn follow_page(
    ctx: &mut ThreadContext,
    page: &HashIntermediatePage,
    index: usize,
    storage_id: u64,
    child_is_intermediate: bool,
) -> Result<DualPagePointer> {
    let existing = page.child(index);
    if !existing.is_null() {
        return Ok(existing);
    }
    let new_offset = ctx
        .allocate_page()
        .context("follow_page: allocating new child page")?;
    let ptr = ctx.page_ptr(new_offset);
    if child_is_intermediate {
        unsafe { HashIntermediatePage::init(ptr, storage_id) };
    } else {
        // The bin number isn't recoverable from the intermediate index alone at this call
        // site; callers that need `bin` on the fresh page re-derive it from `combo.bin` and
        // overwrite it immediately after `locate_bin` returns via `ensure_bin_head`.
        unsafe { HashDataPage::init(ptr, storage_id, 0) };
    }
    let candidate = DualPagePointer::new(new_offset, 0);
    Ok(page.install_child(index, candidate))
}

/// Ensure the data page returned by [`locate_bin`] is tagged with the correct bin number (fixes
/// up the placeholder `bin: 0` a freshly materialized leaf may have been initialized with).
pub fn ensure_bin_head(ctx: &ThreadContext, head: DualPagePointer, bin: u64) {
    let page = data_page_at(ctx, head.volatile_offset);
    if page.bin() != bin && page.slot_count() == 0 {
        // Safe: only the thread that just materialized this (still-unpublished-to-other-bins)
        // page reaches here with slot_count still zero.
        unsafe {
            HashDataPage::init(ctx.page_ptr(head.volatile_offset), page.storage_id(), bin);
        }
    }
}

fn matches(page: &HashDataPage, index: usize, combo: &HashCombo, key: &[u8]) -> bool {
    let slot = page.slot(index);
    if slot.fingerprint != combo.fingerprint {
        return false;
    }
    let (k, _v) = page.record(index);
    k == key
}

/// Search a bin's data-page chain for `key`. Registers a read-set entry on success.
pub fn locate_record(
    ctx: &mut ThreadContext,
    bin_head: DualPagePointer,
    combo: &HashCombo,
    key: &[u8],
    mode: SearchMode,
) -> Result<Option<RecordLocation>> {
    let mut current = bin_head;
    while !current.is_null() {
        let page = data_page_at(ctx, current.volatile_offset);
        let sample = page.page_version().begin_read();
        for index in 0..page.slot_count() {
            if mode == SearchMode::Logical && page.slot(index).is_moved() {
                continue;
            }
            if matches(&page, index, combo, key) {
                let observed_xid = page.load_xid(index);
                if !page.page_version().validate_read(sample) {
                    return Err(CoreError::from(ErrorCode::RaceRetry)
                        .context("locate_record: page mutated during scan"));
                }
                let location = RecordLocation {
                    page_offset: current.volatile_offset,
                    slot_index: index,
                    observed_xid,
                };
                ctx.record_read(location.slot_ref(), observed_xid);
                return Ok(Some(location));
            }
        }
        ctx.record_page_version(current.volatile_offset, sample);
        current = page.next_page();
    }
    Ok(None)
}

/// Locate a record, or physically reserve a new slot for it if absent: walks to the tail of the
/// bin's chain, allocating a fresh overflow page via [`append_next_volatile_page`] if the tail is
/// full.
pub fn locate_record_reserve_physical(
    ctx: &mut ThreadContext,
    bin_head: DualPagePointer,
    storage_id: u64,
    combo: &HashCombo,
    key: &[u8],
    value: &[u8],
    xid: Xid,
) -> Result<RecordLocation> {
    if let Some(found) = locate_record(ctx, bin_head, combo, key, SearchMode::Logical)? {
        return Ok(found);
    }

    let mut current = bin_head;
    loop {
        let page = data_page_at(ctx, current.volatile_offset);
        let examined = page.slot_count();
        let _guard = page.page_version().lock();

        // Another thread may have inserted this key into a slot appended between our pre-lock
        // scan and taking this page's lock; re-scan just that tail before reserving a new slot.
        for index in examined..page.slot_count() {
            if page.slot(index).is_moved() {
                continue;
            }
            if matches(&page, index, combo, key) {
                let observed_xid = page.load_xid(index);
                let location = RecordLocation {
                    page_offset: current.volatile_offset,
                    slot_index: index,
                    observed_xid,
                };
                ctx.record_read(location.slot_ref(), observed_xid);
                return Ok(location);
            }
        }

        if page.has_room_for(key.len(), value.len()) {
            let index = page
                .append_record(xid, combo.fingerprint, key, value)
                .ok_or_else(|| {
                    CoreError::from(ErrorCode::DataCorruption)
                        .context("locate_record_reserve_physical: capacity check passed but append failed")
                })?;
            let location = RecordLocation {
                page_offset: current.volatile_offset,
                slot_index: index,
                observed_xid: xid,
            };
            ctx.record_write(location.slot_ref());
            return Ok(location);
        }
        let next = page.next_page();
        if !next.is_null() {
            drop(_guard);
            current = next;
            continue;
        }
        let new_tail = append_next_volatile_page(ctx, &page, storage_id, combo.bin)?;
        drop(_guard);
        current = new_tail;
    }
}

/// Allocate a new data page and link it as `page`'s overflow successor. If another thread wins
/// the race to install the link first, the freshly allocated page is released back to the pool
/// and the winner's page is returned.
pub fn append_next_volatile_page(
    ctx: &mut ThreadContext,
    page: &HashDataPage,
    storage_id: u64,
    bin: u64,
) -> Result<DualPagePointer> {
    let new_offset = ctx
        .allocate_page()
        .context("append_next_volatile_page: allocating overflow page")?;
    unsafe { HashDataPage::init(ctx.page_ptr(new_offset), storage_id, bin) };
    let candidate = DualPagePointer::new(new_offset, 0);
    let installed = page.install_next_page(candidate);
    if installed != candidate {
        ctx.release_page(new_offset);
    }
    Ok(installed)
}

/// Migrate a record whose value has outgrown its slot's reserved capacity: append a fresh slot
/// at the chain's tail holding the new value, then mark the old slot moved.
///
/// The current page's version lock is taken first, then (while still held) the tail page's
/// version lock, so two concurrent
/// migrations of records in the same page can never deadlock against each other. The new slot
/// is installed (and made visible via the tail page's own version bump) strictly before the old
/// slot's moved bit is set, so a concurrent reader can never observe `moved = true` without the
/// successor already being locatable.
pub fn migrate_record(
    ctx: &mut ThreadContext,
    cur_page_offset: PageOffset,
    cur_slot_index: usize,
    storage_id: u64,
    combo: &HashCombo,
    key: &[u8],
    new_value: &[u8],
    epoch: Epoch,
) -> Result<RecordLocation> {
    let cur_page = data_page_at(ctx, cur_page_offset);
    let cur_guard = cur_page.page_version().lock();

    let old_xid = cur_page.load_xid(cur_slot_index);
    if old_xid.is_moved() {
        return Err(CoreError::from(ErrorCode::RaceRetry)
            .context("migrate_record: slot already moved by a concurrent migration"));
    }

    let mut current = cur_page_offset;
    let new_location = loop {
        let tail = data_page_at(ctx, current);
        let tail_guard = if current == cur_page_offset {
            None
        } else {
            Some(tail.page_version().lock())
        };
        if tail.has_room_for(key.len(), new_value.len()) {
            let new_xid = Xid::new(epoch, old_xid.ordinal().wrapping_add(1));
            let index = tail
                .append_record(new_xid, combo.fingerprint, key, new_value)
                .ok_or_else(|| {
                    CoreError::from(ErrorCode::DataCorruption)
                        .context("migrate_record: capacity check passed but append failed")
                })?;
            drop(tail_guard);
            break RecordLocation {
                page_offset: current,
                slot_index: index,
                observed_xid: new_xid,
            };
        }
        let next = tail.next_page();
        if !next.is_null() {
            drop(tail_guard);
            current = next.volatile_offset;
            continue;
        }
        let new_tail = append_next_volatile_page(ctx, &tail, storage_id, combo.bin)?;
        drop(tail_guard);
        current = new_tail.volatile_offset;
    };

    cur_page.mark_moved(cur_slot_index);
    drop(cur_guard);
    ctx.record_write(new_location.slot_ref());
    Ok(new_location)
}
