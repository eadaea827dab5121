//! Volatile page pools.
//!
//! Each node owns an arena of 4 KiB page slots. Pages are identified by
//! a compact pool offset; [`PagePools::resolve`] decomposes a
//! [`VolatilePointer`] into (node, offset) and array-indexes the node's
//! arena. Resolution is infallible for valid offsets.
//!
//! Offset zero is reserved as the "no page" sentinel and never handed
//! out. Pages are not zeroed on `grab`; callers must initialize them.
//! Double release is detected with a debug-only free marker.

use std::alloc::{self, Layout};

use parking_lot::Mutex;

use crate::error::{EngineResult, ErrorCode};
use crate::page::{VolatilePointer, PAGE_SIZE};

/// Offset of a page slot within a node's pool. Zero = "no page".
pub type PagePoolOffset = u32;

// ============================================================================
//  NodePool
// ============================================================================

/// One node's arena of page slots plus its free list.
pub struct NodePool {
    node: u8,
    base: *mut u8,
    capacity_pages: u32,
    layout: Layout,
    free: Mutex<FreeList>,
}

struct FreeList {
    offsets: Vec<PagePoolOffset>,
    /// Debug-only release markers, one bit per slot.
    #[cfg(debug_assertions)]
    released: Vec<bool>,
}

// The arena base is shared across worker threads; all synchronization
// happens through page version words and the free-list mutex.
unsafe impl Send for NodePool {}
unsafe impl Sync for NodePool {}

impl NodePool {
    /// Allocate an arena of `pool_bytes` for `node`.
    ///
    /// The usable capacity excludes the reserved zero slot.
    pub fn new(node: u8, pool_bytes: usize) -> EngineResult<Self> {
        let capacity_pages = (pool_bytes / PAGE_SIZE) as u32;
        if capacity_pages < 2 {
            return Err(ErrorCode::ConfValueOutOfRange(format!(
                "page pool of {pool_bytes} bytes holds fewer than 2 pages"
            )));
        }
        let layout = Layout::from_size_align(capacity_pages as usize * PAGE_SIZE, PAGE_SIZE)
            .map_err(|e| ErrorCode::Internal(format!("page pool layout: {e}")))?;

        // SAFETY: layout has non-zero size (>= 2 pages).
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(ErrorCode::NoFreePages);
        }

        // Slot 0 is the null sentinel; hand out 1..capacity. Reversed so
        // that grabs come out in ascending offset order.
        let offsets: Vec<PagePoolOffset> = (1..capacity_pages).rev().collect();
        tracing::debug!(node, capacity_pages, "volatile page pool allocated");
        Ok(Self {
            node,
            base,
            capacity_pages,
            layout,
            free: Mutex::new(FreeList {
                offsets,
                #[cfg(debug_assertions)]
                released: vec![false; capacity_pages as usize],
            }),
        })
    }

    #[inline]
    #[must_use]
    pub const fn node(&self) -> u8 {
        self.node
    }

    /// Usable slot count (excludes the zero sentinel).
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity_pages - 1
    }

    /// Currently free slot count.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().offsets.len()
    }

    /// Grab one free page slot. No zeroing; callers must initialize.
    pub fn grab(&self) -> EngineResult<PagePoolOffset> {
        let mut free = self.free.lock();
        let offset = free.offsets.pop().ok_or(ErrorCode::NoFreePages)?;
        #[cfg(debug_assertions)]
        {
            free.released[offset as usize] = false;
        }
        Ok(offset)
    }

    /// Return one page slot to the pool.
    pub fn release(&self, offset: PagePoolOffset) {
        debug_assert!(offset != 0, "released the null sentinel");
        debug_assert!(offset < self.capacity_pages, "offset beyond pool");
        let mut free = self.free.lock();
        #[cfg(debug_assertions)]
        {
            assert!(!free.released[offset as usize], "double release of page slot");
            free.released[offset as usize] = true;
        }
        free.offsets.push(offset);
    }

    /// Return a batch of slots in one lock acquisition.
    pub fn release_many(&self, offsets: &[PagePoolOffset]) {
        let mut free = self.free.lock();
        for &offset in offsets {
            debug_assert!(offset != 0 && offset < self.capacity_pages);
            #[cfg(debug_assertions)]
            {
                assert!(!free.released[offset as usize], "double release of page slot");
                free.released[offset as usize] = true;
            }
            free.offsets.push(offset);
        }
    }

    /// Resolve an offset to the slot's address. Infallible for valid
    /// offsets; the offset's validity is the caller's invariant.
    #[inline]
    #[must_use]
    pub fn resolve(&self, offset: PagePoolOffset) -> *mut u8 {
        debug_assert!(offset != 0 && offset < self.capacity_pages);
        // SAFETY: offset is within the arena by the caller's invariant.
        unsafe { self.base.add(offset as usize * PAGE_SIZE) }
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        // SAFETY: base was allocated with this layout in `new`.
        unsafe { alloc::dealloc(self.base, self.layout) };
    }
}

// ============================================================================
//  PagePools (global resolver)
// ============================================================================

/// All node pools, indexed by node id. Doubles as the global resolver.
pub struct PagePools {
    pools: Vec<NodePool>,
}

impl PagePools {
    pub fn new(nodes: u16, pool_bytes_per_node: usize) -> EngineResult<Self> {
        let mut pools = Vec::with_capacity(nodes as usize);
        for node in 0..nodes {
            pools.push(NodePool::new(node as u8, pool_bytes_per_node)?);
        }
        Ok(Self { pools })
    }

    #[inline]
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    #[must_use]
    pub fn pool(&self, node: u8) -> &NodePool {
        &self.pools[node as usize]
    }

    /// Grab a page on `node` and return its global pointer (flags clear).
    pub fn grab_on(&self, node: u8) -> EngineResult<VolatilePointer> {
        let offset = self.pool(node).grab()?;
        Ok(VolatilePointer::new(node, 0, 0, offset))
    }

    /// Decompose the pointer's high bits to pick the arena, then
    /// array-index. Infallible for valid pointers.
    #[inline]
    #[must_use]
    pub fn resolve(&self, pointer: VolatilePointer) -> *mut u8 {
        debug_assert!(!pointer.is_null());
        self.pool(pointer.node()).resolve(pointer.offset())
    }

    /// Fraction of pool slots currently free, for the snapshot trigger.
    #[must_use]
    pub fn free_percent(&self) -> u8 {
        let capacity: u64 = self.pools.iter().map(|p| u64::from(p.capacity())).sum();
        if capacity == 0 {
            return 0;
        }
        let free: u64 = self.pools.iter().map(|p| p.free_count() as u64).sum();
        ((free * 100) / capacity) as u8
    }
}

// ============================================================================
//  RoundRobinGrabBatch
// ============================================================================

/// Grabs pages rotating across nodes, used at storage creation to spread
/// a bulk allocation over all arenas.
pub struct RoundRobinGrabBatch<'a> {
    pools: &'a PagePools,
    next_node: usize,
}

impl<'a> RoundRobinGrabBatch<'a> {
    #[must_use]
    pub fn new(pools: &'a PagePools) -> Self {
        Self {
            pools,
            next_node: 0,
        }
    }

    /// Grab from the next node in rotation, skipping exhausted nodes.
    pub fn grab(&mut self) -> EngineResult<VolatilePointer> {
        let nodes = self.pools.node_count();
        for _ in 0..nodes {
            let node = self.next_node % nodes;
            self.next_node = (self.next_node + 1) % nodes;
            match self.pools.grab_on(node as u8) {
                Ok(pointer) => return Ok(pointer),
                Err(ErrorCode::NoFreePages) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ErrorCode::NoFreePages)
    }
}

// ============================================================================
//  PageReleaseBatch
// ============================================================================

/// Collects page pointers for amortized release.
///
/// The caller must have retired all references to the collected pages
/// before calling [`PageReleaseBatch::release_all`].
#[derive(Default)]
pub struct PageReleaseBatch {
    per_node: Vec<Vec<PagePoolOffset>>,
}

impl PageReleaseBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one page for release.
    pub fn release(&mut self, pointer: VolatilePointer) {
        debug_assert!(!pointer.is_null());
        let node = pointer.node() as usize;
        if self.per_node.len() <= node {
            self.per_node.resize_with(node + 1, Vec::new);
        }
        self.per_node[node].push(pointer.offset());
    }

    /// Return all queued pages to their owning pools.
    pub fn release_all(mut self, pools: &PagePools) {
        for (node, offsets) in self.per_node.drain(..).enumerate() {
            if !offsets.is_empty() {
                pools.pool(node as u8).release_many(&offsets);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.per_node.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pools() -> PagePools {
        PagePools::new(2, 64 * PAGE_SIZE).unwrap()
    }

    #[test]
    fn test_grab_release_round_trip() {
        let pools = small_pools();
        let before = pools.pool(0).free_count();
        let p = pools.grab_on(0).unwrap();
        assert!(!p.is_null());
        assert_eq!(p.node(), 0);
        assert_eq!(pools.pool(0).free_count(), before - 1);
        pools.pool(0).release(p.offset());
        assert_eq!(pools.pool(0).free_count(), before);
    }

    #[test]
    fn test_zero_offset_never_handed_out() {
        let pools = small_pools();
        let mut grabbed = Vec::new();
        while let Ok(p) = pools.grab_on(0) {
            assert_ne!(p.offset(), 0);
            grabbed.push(p.offset());
        }
        assert_eq!(grabbed.len(), 63);
        pools.pool(0).release_many(&grabbed);
    }

    #[test]
    fn test_exhaustion_returns_no_free_pages() {
        let pools = small_pools();
        let mut grabbed = Vec::new();
        while let Ok(p) = pools.grab_on(1) {
            grabbed.push(p.offset());
        }
        assert!(matches!(pools.grab_on(1), Err(ErrorCode::NoFreePages)));
        pools.pool(1).release_many(&grabbed);
        assert!(pools.grab_on(1).is_ok());
    }

    #[test]
    fn test_resolve_distinct_addresses() {
        let pools = small_pools();
        let a = pools.grab_on(0).unwrap();
        let b = pools.grab_on(0).unwrap();
        let pa = pools.resolve(a);
        let pb = pools.resolve(b);
        assert_ne!(pa, pb);
        assert_eq!(
            pa.align_offset(PAGE_SIZE),
            0,
            "page addresses are page-aligned"
        );
        pools.pool(0).release(a.offset());
        pools.pool(0).release(b.offset());
    }

    #[test]
    fn test_round_robin_rotates_nodes() {
        let pools = small_pools();
        let mut batch = RoundRobinGrabBatch::new(&pools);
        let a = batch.grab().unwrap();
        let b = batch.grab().unwrap();
        assert_ne!(a.node(), b.node());
        pools.pool(a.node()).release(a.offset());
        pools.pool(b.node()).release(b.offset());
    }

    #[test]
    fn test_release_batch() {
        let pools = small_pools();
        let free0 = pools.pool(0).free_count();
        let free1 = pools.pool(1).free_count();
        let mut batch = PageReleaseBatch::new();
        for _ in 0..4 {
            batch.release(pools.grab_on(0).unwrap());
            batch.release(pools.grab_on(1).unwrap());
        }
        assert_eq!(batch.len(), 8);
        batch.release_all(&pools);
        assert_eq!(pools.pool(0).free_count(), free0);
        assert_eq!(pools.pool(1).free_count(), free1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double release")]
    fn test_double_release_detected() {
        let pools = small_pools();
        let p = pools.grab_on(0).unwrap();
        pools.pool(0).release(p.offset());
        pools.pool(0).release(p.offset());
    }

    #[test]
    fn test_free_percent() {
        let pools = small_pools();
        assert_eq!(pools.free_percent(), 100);
        let p = pools.grab_on(0).unwrap();
        assert!(pools.free_percent() < 100);
        pools.pool(0).release(p.offset());
    }
}
