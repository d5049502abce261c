//! Thin per-storage facade over [`crate::location`]: the public record operations a caller
//! actually invokes — `get_record`, `get_record_part`, `insert_record`, `delete_record`,
//! `upsert_record`, `overwrite_record`/`overwrite_record_primitive`,
//! `get_record_primitive`, `increment_record`.

use std::sync::Arc;

use crate::control_block::HashStorageControlBlock;
use crate::data_page::HashDataPage;
use crate::epoch::{Epoch, Xid};
use crate::error::{CoreError, ErrorCode, Result};
use crate::hash_combo::HashCombo;
use crate::location::{
    ensure_bin_head, locate_bin, locate_record, locate_record_reserve_physical, migrate_record,
    RecordLocation, SearchMode,
};
use crate::thread_context::ThreadContext;

/// A single durable write, queued by a transaction's commit protocol and replayed in commit
/// order. Persistence (actually writing these to a log file) is a non-goal; this is the
/// in-memory record of "what commit did", kept for `batch_sort_logs`. `ordinal` breaks ties
/// between entries sharing an epoch, the same role `Xid::ordinal` plays for slots.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub storage_id: u32,
    pub bin: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub epoch: Epoch,
    pub ordinal: u32,
    pub deleted: bool,
}

/// A record-oriented view over one hash storage, bound to its control block.
pub struct HashStorage {
    pub control_block: Arc<HashStorageControlBlock>,
}

impl HashStorage {
    pub fn new(control_block: Arc<HashStorageControlBlock>) -> Self {
        HashStorage { control_block }
    }

    fn combo(&self, key: &[u8]) -> HashCombo {
        HashCombo::derive(key, self.control_block.metadata.bin_bits)
    }

    fn bin_head(&self, ctx: &mut ThreadContext, combo: &HashCombo) -> Result<crate::page::DualPagePointer> {
        let head = locate_bin(&self.control_block, ctx, combo)?;
        ensure_bin_head(ctx, head, combo.bin);
        Ok(head)
    }

    fn find(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
    ) -> Result<(HashCombo, Option<RecordLocation>)> {
        let combo = self.combo(key);
        let head = self.bin_head(ctx, &combo)?;
        let found = locate_record(ctx, head, &combo, key, SearchMode::Logical)?;
        Ok((combo, found))
    }

    /// Full-value read.
    pub fn get_record(&self, ctx: &mut ThreadContext, key: &[u8]) -> Result<Vec<u8>> {
        let (_, found) = self.find(ctx, key)?;
        let location = found.ok_or_else(|| CoreError::from(ErrorCode::NotFound))?;
        if location.observed_xid.is_deleted() {
            return Err(CoreError::from(ErrorCode::NotFound));
        }
        let page = unsafe { HashDataPage::from_raw(ctx.page_ptr(location.page_offset)) };
        let (_, value) = page.record(location.slot_index);
        Ok(value.to_vec())
    }

    /// Partial-value read at a byte offset/length.
    pub fn get_record_part(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>> {
        let full = self.get_record(ctx, key)?;
        full.get(offset..offset + len)
            .map(|s| s.to_vec())
            .ok_or_else(|| {
                CoreError::from(ErrorCode::DataCorruption)
                    .context("get_record_part: offset/len out of bounds")
            })
    }

    /// Insert a brand-new record; fails if the key already exists.
    pub fn insert_record(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
        value: &[u8],
        epoch: Epoch,
    ) -> Result<()> {
        let (combo, found) = self.find(ctx, key)?;
        if let Some(loc) = found {
            if !loc.observed_xid.is_deleted() {
                return Err(CoreError::from(ErrorCode::RaceRetry)
                    .context("insert_record: key already present"));
            }
        }
        let head = self.bin_head(ctx, &combo)?;
        let xid = Xid::new(epoch, 0);
        locate_record_reserve_physical(
            ctx,
            head,
            self.control_block.id as u64,
            &combo,
            key,
            value,
            xid,
        )?;
        Ok(())
    }

    /// Insert-or-overwrite.
    pub fn upsert_record(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
        value: &[u8],
        epoch: Epoch,
    ) -> Result<()> {
        let (combo, found) = self.find(ctx, key)?;
        match found {
            Some(loc) if !loc.observed_xid.is_deleted() => {
                self.overwrite_or_migrate(ctx, &combo, key, value, loc, epoch)
            }
            _ => {
                let head = self.bin_head(ctx, &combo)?;
                let xid = Xid::new(epoch, 0);
                locate_record_reserve_physical(
                    ctx,
                    head,
                    self.control_block.id as u64,
                    &combo,
                    key,
                    value,
                    xid,
                )?;
                Ok(())
            }
        }
    }

    /// Overwrite an existing record's full value, in place when it fits the reserved capacity
    /// and via migration otherwise.
    pub fn overwrite_record(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
        value: &[u8],
        epoch: Epoch,
    ) -> Result<()> {
        let (combo, found) = self.find(ctx, key)?;
        let loc = found.ok_or_else(|| CoreError::from(ErrorCode::NotFound))?;
        if loc.observed_xid.is_deleted() {
            return Err(CoreError::from(ErrorCode::NotFound));
        }
        self.overwrite_or_migrate(ctx, &combo, key, value, loc, epoch)
    }

    /// Read a fixed-width `Pod` value out of a record's leading bytes. A thin generic wrapper
    /// over [`Self::get_record_part`] for callers that want a typed value rather than raw bytes.
    pub fn get_record_primitive<T: bytemuck::Pod>(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
    ) -> Result<T> {
        let len = std::mem::size_of::<T>();
        let bytes = self.get_record_part(ctx, key, 0, len)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    /// Overwrite a byte range of an existing record's value. This engine doesn't distinguish
    /// fixed-width primitive fields from opaque byte values, so it's just a ranged overwrite.
    pub fn overwrite_record_primitive(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
        offset: usize,
        bytes: &[u8],
        epoch: Epoch,
    ) -> Result<()> {
        let current = self.get_record(ctx, key)?;
        let mut next = current;
        if offset + bytes.len() > next.len() {
            next.resize(offset + bytes.len(), 0);
        }
        next[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.overwrite_record(ctx, key, &next, epoch)
    }

    /// Read-modify-write a little-endian `i64` counter embedded at the record's start.
    pub fn increment_record(
        &self,
        ctx: &mut ThreadContext,
        key: &[u8],
        delta: i64,
        epoch: Epoch,
    ) -> Result<i64> {
        let current = self.get_record(ctx, key)?;
        let mut bytes = [0u8; 8];
        let n = current.len().min(8);
        bytes[..n].copy_from_slice(&current[..n]);
        let next = i64::from_le_bytes(bytes).wrapping_add(delta);
        self.overwrite_record(ctx, key, &next.to_le_bytes(), epoch)?;
        Ok(next)
    }

    /// Logically delete a record by flipping its XID's deleted bit, leaving the slot (and its
    /// bytes) in place — physical reclamation is out of scope (non-goal: garbage collection).
    pub fn delete_record(&self, ctx: &mut ThreadContext, key: &[u8], epoch: Epoch) -> Result<()> {
        let (_, found) = self.find(ctx, key)?;
        let loc = found.ok_or_else(|| CoreError::from(ErrorCode::NotFound))?;
        if loc.observed_xid.is_deleted() {
            return Err(CoreError::from(ErrorCode::NotFound));
        }
        let page = unsafe { HashDataPage::from_raw(ctx.page_ptr(loc.page_offset)) };
        let new_xid = Xid::new(epoch, loc.observed_xid.ordinal().wrapping_add(1)).with_deleted(true);
        page.compare_exchange_xid(loc.slot_index, loc.observed_xid, new_xid)
            .map_err(|_| CoreError::from(ErrorCode::RaceRetry).context("delete_record: xid changed underneath us"))?;
        Ok(())
    }

    fn overwrite_or_migrate(
        &self,
        ctx: &mut ThreadContext,
        combo: &HashCombo,
        key: &[u8],
        value: &[u8],
        loc: RecordLocation,
        epoch: Epoch,
    ) -> Result<()> {
        let page = unsafe { HashDataPage::from_raw(ctx.page_ptr(loc.page_offset)) };
        if page.overwrite_value_in_place(loc.slot_index, value) {
            let new_xid = Xid::new(epoch, loc.observed_xid.ordinal().wrapping_add(1));
            page.compare_exchange_xid(loc.slot_index, loc.observed_xid, new_xid)
                .map_err(|_| {
                    CoreError::from(ErrorCode::RaceRetry)
                        .context("overwrite_record: xid changed underneath us")
                })?;
            return Ok(());
        }
        migrate_record(
            ctx,
            loc.page_offset,
            loc.slot_index,
            self.control_block.id as u64,
            combo,
            key,
            value,
            epoch,
        )?;
        Ok(())
    }

    /// Sort a batch of pending log entries by `(key, epoch, ordinal)` and compact consecutive
    /// overwrites of the same key down to the latest one. A delete is still the latest entry for
    /// its key when it is one, so it survives compaction as a tombstone rather than being dropped.
    pub fn batch_sort_logs(entries: &[LogEntry]) -> Vec<LogEntry> {
        let mut sorted: Vec<LogEntry> = entries.to_vec();
        sorted.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then_with(|| a.epoch.value().cmp(&b.epoch.value()))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        let mut compacted: Vec<LogEntry> = Vec::with_capacity(sorted.len());
        for entry in sorted {
            match compacted.last_mut() {
                Some(last) if last.key == entry.key => *last = entry,
                _ => compacted.push(entry),
            }
        }
        compacted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_combo::HashMetadata;
    use crate::intermediate_page::HashIntermediatePage;
    use crate::numa::NumaNodePool;
    use crate::page::DualPagePointer;

    fn setup() -> (HashStorage, ThreadContext) {
        let node = Arc::new(NumaNodePool::new(0, 256, 0));
        let mut ctx = ThreadContext::new(0, node);
        let root_offset = ctx.allocate_page().unwrap();
        unsafe { HashIntermediatePage::init(ctx.page_ptr(root_offset), 1) };
        let cb = Arc::new(HashStorageControlBlock::new(
            1,
            "t".into(),
            HashMetadata::new(6),
            1,
        ));
        cb.mark_created(DualPagePointer::new(root_offset, 0));
        (HashStorage::new(cb), ctx)
    }

    #[test]
    fn insert_then_get_round_trips() {
        let (storage, mut ctx) = setup();
        storage
            .insert_record(&mut ctx, b"k1", b"v1", Epoch::new(1))
            .unwrap();
        assert_eq!(storage.get_record(&mut ctx, b"k1").unwrap(), b"v1");
    }

    #[test]
    fn insert_twice_without_delete_fails() {
        let (storage, mut ctx) = setup();
        storage
            .insert_record(&mut ctx, b"k1", b"v1", Epoch::new(1))
            .unwrap();
        let err = storage
            .insert_record(&mut ctx, b"k1", b"v2", Epoch::new(1))
            .unwrap_err();
        assert!(err.is(ErrorCode::RaceRetry));
    }

    #[test]
    fn upsert_then_overwrite_in_place() {
        let (storage, mut ctx) = setup();
        storage
            .upsert_record(&mut ctx, b"k1", b"aaaa", Epoch::new(1))
            .unwrap();
        storage
            .overwrite_record(&mut ctx, b"k1", b"bbbb", Epoch::new(1))
            .unwrap();
        assert_eq!(storage.get_record(&mut ctx, b"k1").unwrap(), b"bbbb");
    }

    #[test]
    fn overwrite_with_longer_value_migrates() {
        let (storage, mut ctx) = setup();
        storage
            .upsert_record(&mut ctx, b"k1", b"short", Epoch::new(1))
            .unwrap();
        let longer = vec![b'x'; 64];
        storage
            .overwrite_record(&mut ctx, b"k1", &longer, Epoch::new(1))
            .unwrap();
        assert_eq!(storage.get_record(&mut ctx, b"k1").unwrap(), longer);
    }

    #[test]
    fn delete_then_get_not_found_then_reinsert_succeeds() {
        let (storage, mut ctx) = setup();
        storage
            .insert_record(&mut ctx, b"k1", b"v1", Epoch::new(1))
            .unwrap();
        storage.delete_record(&mut ctx, b"k1", Epoch::new(1)).unwrap();
        assert!(storage.get_record(&mut ctx, b"k1").is_err());
        storage
            .insert_record(&mut ctx, b"k1", b"v2", Epoch::new(2))
            .unwrap();
        assert_eq!(storage.get_record(&mut ctx, b"k1").unwrap(), b"v2");
    }

    #[test]
    fn increment_record_accumulates() {
        let (storage, mut ctx) = setup();
        storage
            .upsert_record(&mut ctx, b"counter", &0i64.to_le_bytes(), Epoch::new(1))
            .unwrap();
        let v1 = storage
            .increment_record(&mut ctx, b"counter", 5, Epoch::new(1))
            .unwrap();
        let v2 = storage
            .increment_record(&mut ctx, b"counter", 3, Epoch::new(1))
            .unwrap();
        assert_eq!(v1, 5);
        assert_eq!(v2, 8);
    }

    #[test]
    fn get_record_primitive_reads_leading_fixed_width_value() {
        let (storage, mut ctx) = setup();
        storage
            .upsert_record(&mut ctx, b"counter", &42i64.to_le_bytes(), Epoch::new(1))
            .unwrap();
        let v: i64 = storage.get_record_primitive(&mut ctx, b"counter").unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn batch_sort_logs_orders_by_key_then_epoch_then_ordinal() {
        let entries = vec![
            LogEntry {
                storage_id: 1,
                bin: 2,
                key: b"b".to_vec(),
                value: vec![1],
                epoch: Epoch::new(1),
                ordinal: 0,
                deleted: false,
            },
            LogEntry {
                storage_id: 1,
                bin: 1,
                key: b"a".to_vec(),
                value: vec![2],
                epoch: Epoch::new(1),
                ordinal: 0,
                deleted: false,
            },
            LogEntry {
                storage_id: 1,
                bin: 1,
                key: b"z".to_vec(),
                value: vec![3],
                epoch: Epoch::new(1),
                ordinal: 0,
                deleted: false,
            },
        ];
        let sorted = HashStorage::batch_sort_logs(&entries);
        assert_eq!(sorted[0].key, b"a");
        assert_eq!(sorted[1].key, b"b");
        assert_eq!(sorted[2].key, b"z");
    }

    #[test]
    fn batch_sort_logs_compacts_overwrites_to_the_latest_entry() {
        let entries = vec![
            LogEntry {
                storage_id: 1,
                bin: 0,
                key: b"k".to_vec(),
                value: vec![1],
                epoch: Epoch::new(1),
                ordinal: 0,
                deleted: false,
            },
            LogEntry {
                storage_id: 1,
                bin: 0,
                key: b"k".to_vec(),
                value: vec![2],
                epoch: Epoch::new(1),
                ordinal: 1,
                deleted: false,
            },
            LogEntry {
                storage_id: 1,
                bin: 0,
                key: b"other".to_vec(),
                value: vec![9],
                epoch: Epoch::new(1),
                ordinal: 0,
                deleted: false,
            },
        ];
        let compacted = HashStorage::batch_sort_logs(&entries);
        assert_eq!(compacted.len(), 2);
        let k = compacted.iter().find(|e| e.key == b"k").unwrap();
        assert_eq!(k.value, vec![2]);
    }

    #[test]
    fn batch_sort_logs_keeps_a_trailing_delete_as_a_tombstone() {
        let entries = vec![
            LogEntry {
                storage_id: 1,
                bin: 0,
                key: b"k".to_vec(),
                value: vec![1],
                epoch: Epoch::new(1),
                ordinal: 0,
                deleted: false,
            },
            LogEntry {
                storage_id: 1,
                bin: 0,
                key: b"k".to_vec(),
                value: vec![],
                epoch: Epoch::new(1),
                ordinal: 1,
                deleted: true,
            },
        ];
        let compacted = HashStorage::batch_sort_logs(&entries);
        assert_eq!(compacted.len(), 1);
        assert!(compacted[0].deleted);
    }
}
