//! Top-level engine: NUMA pool setup, storage creation/lookup/drop, and worker thread contexts.
//!
//! `create_hash_storage`/`drop_hash_storage` register with the storage registry and recursively
//! release a dropped storage's whole page tree in one pass rather than leaving pages to be
//! reclaimed piecemeal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::control_block::HashStorageControlBlock;
use crate::error::{CoreError, ErrorCode, Result, ResultExt};
use crate::hash_combo::HashMetadata;
use crate::hash_storage::HashStorage;
use crate::intermediate_page::{HashIntermediatePage, FAN_OUT};
use crate::numa::{NumaNodePool, NumaTopology};
use crate::page::{DualPagePointer, PageOffset};
use crate::registry::StorageRegistry;
use crate::thread_context::ThreadContext;

/// Builder for [`Engine`]: set fields, then call [`EngineConfig::build`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub volatile_pages_per_node: usize,
    pub snapshot_pages_per_node: usize,
    pub topology: Option<NumaTopology>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            volatile_pages_per_node: 16 * 1024,
            snapshot_pages_per_node: 1024,
            topology: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn volatile_pages_per_node(mut self, n: usize) -> Self {
        self.volatile_pages_per_node = n;
        self
    }

    pub fn snapshot_pages_per_node(mut self, n: usize) -> Self {
        self.snapshot_pages_per_node = n;
        self
    }

    pub fn topology(mut self, topology: NumaTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn build(self) -> Engine {
        let topology = self.topology.unwrap_or_else(NumaTopology::detect);
        info!(nodes = topology.node_count, "building engine");
        let nodes = (0..topology.node_count)
            .map(|id| {
                Arc::new(NumaNodePool::new(
                    id,
                    self.volatile_pages_per_node,
                    self.snapshot_pages_per_node,
                ))
            })
            .collect();
        Engine {
            topology,
            nodes,
            registry: StorageRegistry::new(),
            next_worker_id: AtomicU32::new(0),
        }
    }
}

/// Tracks where a recovering engine left off in its (non-goal, so unused at runtime) log
/// stream. Carried in the layout so the ambient persisted-state shape matches what a full
/// engine would checkpoint, per SPEC_FULL.md's ambient-stack section.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerPosition {
    pub epoch: u32,
    pub byte_offset: u64,
}

/// A point-in-time marker an operator can roll the engine's logical clock back to. Durability
/// itself (non-goal) isn't implemented; this struct exists so the engine's public surface has
/// somewhere to record which savepoint was active.
#[derive(Debug, Clone, Default)]
pub struct SavepointState {
    pub current_epoch: u32,
    pub logger_positions: Vec<LoggerPosition>,
}

/// The running engine: one [`NumaNodePool`] per detected node, the storage registry, and
/// worker-id issuance for [`ThreadContext`].
pub struct Engine {
    pub topology: NumaTopology,
    nodes: Vec<Arc<NumaNodePool>>,
    registry: StorageRegistry,
    next_worker_id: AtomicU32,
}

impl Engine {
    pub fn builder() -> EngineConfig {
        EngineConfig::new()
    }

    /// Spawn a [`ThreadContext`] homed on the given core's NUMA node.
    pub fn new_thread_context(&self, core: usize) -> ThreadContext {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let node_id = self.topology.node_for_core(core);
        ThreadContext::new(worker_id, self.nodes[node_id].clone())
    }

    pub fn node(&self, node_id: usize) -> &Arc<NumaNodePool> {
        &self.nodes[node_id]
    }

    /// Create a new hash storage with `expected_records` sized bin count, allocating its root
    /// intermediate page on `ctx`'s home node.
    pub fn create_hash_storage(
        &self,
        ctx: &mut ThreadContext,
        name: &str,
        expected_records: u64,
    ) -> Result<HashStorage> {
        if self.registry.find_by_name(name).is_some() {
            return Err(CoreError::from(ErrorCode::StorageDuplicateId)
                .context("create_hash_storage: name already registered"));
        }
        let metadata = HashMetadata::default_for_capacity(expected_records);
        let levels = levels_for_bin_count(metadata.bin_count);
        let id = self.registry.issue_next_storage_id();
        let control_block = Arc::new(HashStorageControlBlock::new(
            id,
            name.to_string(),
            metadata,
            levels,
        ));

        let root_offset = ctx
            .allocate_page()
            .context("create_hash_storage: allocating root page")?;
        unsafe { HashIntermediatePage::init(ctx.page_ptr(root_offset), id as u64) };
        debug!(
            storage = name,
            id, bin_count = metadata.bin_count, levels, "root page allocated"
        );

        control_block.mark_created(DualPagePointer::new(root_offset, 0));
        self.registry.register_storage(control_block.clone())?;
        Ok(HashStorage::new(control_block))
    }

    pub fn get_hash_storage(&self, name: &str) -> Option<HashStorage> {
        self.registry.find_by_name(name).map(HashStorage::new)
    }

    /// Drop a storage: mark it removed from the registry and recursively release every page in
    /// its tree back to the owning node's pool.
    pub fn drop_hash_storage(&self, ctx: &mut ThreadContext, storage: &HashStorage) {
        let cb = &storage.control_block;
        let root = cb.root_page_pointer();
        if !root.is_null() {
            release_intermediate_recursive(ctx, root.volatile_offset, cb.levels);
        }
        cb.mark_dropped();
        self.registry.remove_storage(cb.id);
    }
}

/// Pick the smallest `levels` such that a tree of that many intermediate levels (root included)
/// can address `bin_count` bins: `FAN_OUT^levels >= bin_count`.
fn levels_for_bin_count(bin_count: u64) -> u8 {
    let mut levels: u8 = 1;
    let mut capacity = FAN_OUT as u64;
    while capacity < bin_count && levels < 8 {
        levels += 1;
        capacity = capacity.saturating_mul(FAN_OUT as u64);
    }
    levels
}

fn release_intermediate_recursive(ctx: &mut ThreadContext, offset: PageOffset, levels: u8) {
    let page = unsafe { HashIntermediatePage::view(ctx.page_ptr(offset)) };
    for i in 0..page.child_count() {
        let child = page.child(i);
        if child.is_null() {
            continue;
        }
        if levels > 1 {
            release_intermediate_recursive(ctx, child.volatile_offset, levels - 1);
        } else {
            release_data_chain(ctx, child.volatile_offset);
        }
    }
    ctx.release_page(offset);
}

fn release_data_chain(ctx: &mut ThreadContext, head: PageOffset) {
    let mut current = head;
    loop {
        let page = unsafe { crate::data_page::HashDataPage::from_raw(ctx.page_ptr(current)) };
        let next = page.next_page();
        ctx.release_page(current);
        if next.is_null() {
            break;
        }
        current = next.volatile_offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_with_single_node_topology() {
        let engine = Engine::builder()
            .topology(NumaTopology::single_node())
            .volatile_pages_per_node(64)
            .build();
        assert_eq!(engine.topology.node_count, 1);
    }

    #[test]
    fn create_get_and_drop_storage() {
        let engine = Engine::builder()
            .topology(NumaTopology::single_node())
            .volatile_pages_per_node(256)
            .build();
        let mut ctx = engine.new_thread_context(0);
        let storage = engine.create_hash_storage(&mut ctx, "widgets", 100).unwrap();
        storage
            .insert_record(&mut ctx, b"k", b"v", crate::epoch::Epoch::new(1))
            .unwrap();
        assert!(engine.get_hash_storage("widgets").is_some());
        engine.drop_hash_storage(&mut ctx, &storage);
        assert!(engine.get_hash_storage("widgets").is_none());
    }

    #[test]
    fn duplicate_name_rejected() {
        let engine = Engine::builder()
            .topology(NumaTopology::single_node())
            .volatile_pages_per_node(128)
            .build();
        let mut ctx = engine.new_thread_context(0);
        engine.create_hash_storage(&mut ctx, "a", 10).unwrap();
        let err = engine.create_hash_storage(&mut ctx, "a", 10).unwrap_err();
        assert!(err.is(ErrorCode::StorageDuplicateId));
    }
}
