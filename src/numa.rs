//! NUMA-aware page pools: per-node central freelists and per-worker local chunks.
//!
//! Each node holds a volatile and a snapshot population side by side. Workers never touch the
//! central freelist directly on the fast path — they check out and return pages in batches via
//! a local [`PagePoolOffsetChunk`]. Topology detection is a best-effort scan of
//! `/sys/devices/system/node`, falling back to a single node when the topology can't be read
//! (non-Linux, containers without the sysfs tree, etc).

use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::error::{CoreError, ErrorCode, Result};
use crate::page::{PageOffset, PAGE_SIZE};

/// How many offsets a worker checks out from (or returns to) the central freelist at once,
/// amortizing lock contention against the central mutex.
pub const CHUNK_CAP: usize = 64;

/// Detected (or assumed) NUMA topology: how many nodes, and which node each logical core
/// belongs to.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    pub node_count: usize,
    pub core_to_node: Vec<usize>,
}

impl NumaTopology {
    /// Best-effort detection: scan `/sys/devices/system/node` for `node<N>` entries on Linux;
    /// otherwise, or if the scan fails, report a single node holding all cores.
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some(topology) = Self::detect_linux() {
                return topology;
            }
        }
        Self::single_node()
    }

    pub fn single_node() -> Self {
        let cores = num_cpus::get().max(1);
        NumaTopology {
            node_count: 1,
            core_to_node: vec![0; cores],
        }
    }

    #[cfg(target_os = "linux")]
    fn detect_linux() -> Option<Self> {
        let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;
        let mut node_ids: Vec<usize> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| name.strip_prefix("node")?.parse::<usize>().ok())
            .collect();
        if node_ids.is_empty() {
            return None;
        }
        node_ids.sort_unstable();
        let node_count = node_ids.len();
        let cores = num_cpus::get().max(1);
        // cpulist files under each node dir would give an exact mapping; absent a parser for
        // that format in the pack, cores are striped round-robin across detected nodes.
        let core_to_node = (0..cores).map(|c| c % node_count).collect();
        Some(NumaTopology {
            node_count,
            core_to_node,
        })
    }

    pub fn node_for_core(&self, core: usize) -> usize {
        self.core_to_node
            .get(core)
            .copied()
            .unwrap_or(0)
            .min(self.node_count.saturating_sub(1))
    }
}

/// Which population a page offset was drawn from. Snapshot pages are a non-goal at runtime
/// (no snapshot writer exists) but the pool still tracks the population so `DualPagePointer`
/// layouts are exercised and future snapshot support has somewhere to plug in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Population {
    Volatile,
    Snapshot,
}

struct CentralFreeList {
    offsets: Vec<PageOffset>,
}

/// Snapshot of one population's free-page count, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePoolStat {
    pub population: Population,
    pub total_pages: usize,
    pub free_pages: usize,
}

/// A single population's (volatile or snapshot) page arena plus its central freelist, for one
/// NUMA node.
struct PagePool {
    population: Population,
    arena: Box<[u8]>,
    free: CachePadded<Mutex<CentralFreeList>>,
}

impl PagePool {
    fn new(population: Population, page_count: usize) -> Self {
        let arena = vec![0u8; page_count * PAGE_SIZE].into_boxed_slice();
        let offsets = (1..=page_count as u32).map(PageOffset).collect();
        PagePool {
            population,
            arena,
            free: CachePadded::new(Mutex::new(CentralFreeList { offsets })),
        }
    }

    fn page_ptr(&self, offset: PageOffset) -> *mut u8 {
        debug_assert!(!offset.is_null());
        let index = (offset.0 - 1) as usize;
        let byte_off = index * PAGE_SIZE;
        // Safety: `arena` is sized to `page_count * PAGE_SIZE` and `index` is always drawn
        // from this pool's own freelist, so `byte_off` stays in bounds.
        unsafe { self.arena.as_ptr().add(byte_off) as *mut u8 }
    }

    fn grab_chunk(&self, out: &mut Vec<PageOffset>, want: usize) -> usize {
        let mut guard = self.free.lock();
        let take = want.min(guard.offsets.len());
        let start = guard.offsets.len() - take;
        out.extend(guard.offsets.drain(start..));
        take
    }

    fn return_chunk(&self, offsets: &mut Vec<PageOffset>) {
        let mut guard = self.free.lock();
        guard.offsets.extend(offsets.drain(..));
    }

    fn stat(&self) -> PagePoolStat {
        PagePoolStat {
            population: self.population,
            total_pages: self.arena.len() / PAGE_SIZE,
            free_pages: self.free.lock().offsets.len(),
        }
    }
}

/// One NUMA node's page pools (volatile + snapshot), matching `NumaNodeMemory`'s pairing.
pub struct NumaNodePool {
    pub node_id: usize,
    volatile: PagePool,
    snapshot: PagePool,
}

impl NumaNodePool {
    pub fn new(node_id: usize, volatile_pages: usize, snapshot_pages: usize) -> Self {
        NumaNodePool {
            node_id,
            volatile: PagePool::new(Population::Volatile, volatile_pages),
            snapshot: PagePool::new(Population::Snapshot, snapshot_pages),
        }
    }

    fn pool(&self, population: Population) -> &PagePool {
        match population {
            Population::Volatile => &self.volatile,
            Population::Snapshot => &self.snapshot,
        }
    }

    pub fn page_ptr(&self, population: Population, offset: PageOffset) -> *mut u8 {
        self.pool(population).page_ptr(offset)
    }

    /// Point-in-time free/total page counts for both populations, for monitoring.
    pub fn dump_free_stat(&self) -> [PagePoolStat; 2] {
        [self.volatile.stat(), self.snapshot.stat()]
    }
}

/// A worker's local checked-out chunk of offsets for one population on one node, standing in
/// for `PagePoolOffsetChunk`. Never blocks the central freelist mutex on the fast path: only
/// refills or drains in batches of [`CHUNK_CAP`].
pub struct PagePoolOffsetChunk {
    node: Arc<NumaNodePool>,
    population: Population,
    local: Vec<PageOffset>,
}

impl PagePoolOffsetChunk {
    pub fn new(node: Arc<NumaNodePool>, population: Population) -> Self {
        PagePoolOffsetChunk {
            node,
            population,
            local: Vec::with_capacity(CHUNK_CAP),
        }
    }

    /// Check out one page offset, refilling from the central freelist in a batch of
    /// [`CHUNK_CAP`] when the local chunk runs dry.
    pub fn allocate(&mut self) -> Result<PageOffset> {
        if self.local.is_empty() {
            let pool = self.node.pool(self.population);
            let got = pool.grab_chunk(&mut self.local, CHUNK_CAP);
            if got == 0 {
                return Err(CoreError::from(ErrorCode::OutOfFreePages)
                    .context("PagePoolOffsetChunk::allocate"));
            }
        }
        Ok(self.local.pop().expect("just refilled or non-empty"))
    }

    /// Return an offset to the local chunk, flushing to the central freelist once the local
    /// chunk doubles past capacity.
    pub fn release(&mut self, offset: PageOffset) {
        self.local.push(offset);
        if self.local.len() > CHUNK_CAP * 2 {
            let pool = self.node.pool(self.population);
            pool.return_chunk(&mut self.local);
        }
    }

    pub fn page_ptr(&self, offset: PageOffset) -> *mut u8 {
        self.node.page_ptr(self.population, offset)
    }

    /// Flush any remaining local offsets back to the central freelist. Called when a worker
    /// shuts down so its checked-out chunk isn't stranded.
    pub fn flush(&mut self) {
        if !self.local.is_empty() {
            let pool = self.node.pool(self.population);
            pool.return_chunk(&mut self.local);
        }
    }
}

impl Drop for PagePoolOffsetChunk {
    fn drop(&mut self) {
        self.flush();
    }
}

/// A batch of pages collected for release, e.g. while recursively freeing a dropped storage's
/// page tree. Accumulated before returning to the pool so a single recursive walk doesn't
/// contend the central freelist mutex once per page.
#[derive(Default)]
pub struct PageReleaseBatch {
    pub volatile: Vec<PageOffset>,
}

impl PageReleaseBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: PageOffset) {
        if !offset.is_null() {
            self.volatile.push(offset);
        }
    }

    pub fn flush_to(&mut self, node: &NumaNodePool) {
        node.volatile.return_chunk(&mut self.volatile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_topology_covers_all_cores() {
        let topo = NumaTopology::single_node();
        assert_eq!(topo.node_count, 1);
        assert!(!topo.core_to_node.is_empty());
        assert_eq!(topo.node_for_core(0), 0);
    }

    #[test]
    fn chunk_allocate_and_release_round_trip() {
        let node = Arc::new(NumaNodePool::new(0, 8, 0));
        let mut chunk = PagePoolOffsetChunk::new(node, Population::Volatile);
        let a = chunk.allocate().unwrap();
        let b = chunk.allocate().unwrap();
        assert_ne!(a, b);
        chunk.release(a);
        chunk.release(b);
    }

    #[test]
    fn allocate_fails_when_pool_exhausted() {
        let node = Arc::new(NumaNodePool::new(0, 2, 0));
        let mut chunk = PagePoolOffsetChunk::new(node, Population::Volatile);
        let _a = chunk.allocate().unwrap();
        let _b = chunk.allocate().unwrap();
        let err = chunk.allocate().unwrap_err();
        assert!(err.is(ErrorCode::OutOfFreePages));
    }

    #[test]
    fn dump_free_stat_reflects_checked_out_pages() {
        let node = NumaNodePool::new(0, 4, 2);
        let before = node.dump_free_stat();
        assert_eq!(before[0].free_pages, 4);
        assert_eq!(before[1].free_pages, 2);
        let node = Arc::new(node);
        let mut chunk = PagePoolOffsetChunk::new(node.clone(), Population::Volatile);
        let _offset = chunk.allocate().unwrap();
        let after = node.dump_free_stat();
        assert_eq!(after[0].total_pages, 4);
        assert!(after[0].free_pages < before[0].free_pages);
    }

    #[test]
    fn release_batch_flushes_to_node_freelist() {
        let node = Arc::new(NumaNodePool::new(0, 4, 0));
        let mut chunk = PagePoolOffsetChunk::new(node.clone(), Population::Volatile);
        let offset = chunk.allocate().unwrap();
        let mut batch = PageReleaseBatch::new();
        batch.push(offset);
        batch.flush_to(&node);
        assert_eq!(batch.volatile.len(), 0);
    }
}
