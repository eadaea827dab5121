//! Fixed-fanout, fixed-depth array index.
//!
//! The simplest storage exercising the transactional write path: a tree
//! over an integer offset space whose depth is determined at creation
//! from the array size and payload size. Lookups decompose the offset
//! into per-level interior indices; records are never created or deleted
//! after construction, only read and overwritten.

pub mod page;

use std::sync::atomic::AtomicBool;

use crate::error::{EngineResult, ErrorCode};
use crate::memory::{PagePools, PageReleaseBatch, RoundRobinGrabBatch};
use crate::ordering::RELAXED;
use crate::page::{DualPointer, StorageId, VolatilePointer};
use crate::storage::{ArrayMetadata, Primitive};
use crate::thread::ThreadContext;
use crate::xct::log::RedoLog;

use page::{records_per_leaf, ArrayPage, INTERIOR_FANOUT};

/// Offset into an array storage.
pub type ArrayOffset = u64;

/// Maximum tree depth; `253^7` records dwarf any in-memory array.
const MAX_LEVELS: usize = 8;

/// Decomposes offsets into per-level interior indices.
#[derive(Debug, Clone, Copy)]
struct LookupRouteFinder {
    levels: u8,
    leaf_records: u64,
}

impl LookupRouteFinder {
    fn new(levels: u8, payload_size: u16) -> Self {
        Self {
            levels,
            leaf_records: records_per_leaf(payload_size),
        }
    }

    fn find_route(&self, offset: ArrayOffset) -> [u16; MAX_LEVELS] {
        let mut route = [0u16; MAX_LEVELS];
        route[0] = (offset % self.leaf_records) as u16;
        let mut upper = offset / self.leaf_records;
        for level in 1..self.levels as usize {
            route[level] = (upper % INTERIOR_FANOUT as u64) as u16;
            upper /= INTERIOR_FANOUT as u64;
        }
        route
    }
}

/// Levels needed to cover `array_size` records.
fn calculate_levels(array_size: u64, payload_size: u16) -> u8 {
    let leaf_records = records_per_leaf(payload_size);
    let mut pages = array_size.div_ceil(leaf_records).max(1);
    let mut levels: u8 = 1;
    while pages != 1 {
        pages = pages.div_ceil(INTERIOR_FANOUT as u64);
        levels += 1;
    }
    levels
}

// ============================================================================
//  ArrayStorage
// ============================================================================

/// An array storage handle.
#[derive(Debug)]
pub struct ArrayStorage {
    metadata: ArrayMetadata,
    levels: u8,
    route_finder: LookupRouteFinder,
    root_pointer: DualPointer,
    exists: AtomicBool,
}

impl ArrayStorage {
    #[inline]
    #[must_use]
    pub fn id(&self) -> StorageId {
        self.metadata.id
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[inline]
    #[must_use]
    pub fn metadata(&self) -> &ArrayMetadata {
        &self.metadata
    }

    #[inline]
    #[must_use]
    pub fn payload_size(&self) -> u16 {
        self.metadata.payload_size
    }

    #[inline]
    #[must_use]
    pub fn array_size(&self) -> ArrayOffset {
        self.metadata.array_size
    }

    #[inline]
    #[must_use]
    pub fn levels(&self) -> u8 {
        self.levels
    }

    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        self.exists.load(RELAXED)
    }

    pub(crate) fn mark_dropped(&self) {
        self.exists.store(false, RELAXED);
    }

    pub(crate) fn root_page_id(&self) -> u64 {
        self.root_pointer.volatile_pointer().word()
    }

    // ========================================================================
    //  Creation / teardown
    // ========================================================================

    /// Create the storage: allocate the leftmost page of every level,
    /// then iterate leaves left to right, pushing new interior pages up
    /// as each level's current page fills.
    pub(crate) fn create(
        context: &ThreadContext,
        metadata: ArrayMetadata,
    ) -> EngineResult<Self> {
        debug_assert!(metadata.id > 0);
        if metadata.array_size == 0 || metadata.payload_size == 0 {
            return Err(ErrorCode::ConfValueOutOfRange(format!(
                "array storage {:?}: array_size and payload_size must be non-zero",
                metadata.name
            )));
        }
        if records_per_leaf(metadata.payload_size) == 0 {
            return Err(ErrorCode::TooLongPayload {
                length: usize::from(metadata.payload_size),
            });
        }
        let levels = calculate_levels(metadata.array_size, metadata.payload_size);
        if levels as usize > MAX_LEVELS {
            return Err(ErrorCode::ConfValueOutOfRange(format!(
                "array storage {:?}: too many levels",
                metadata.name
            )));
        }
        let initial_epoch = context.current_global_epoch();
        tracing::info!(
            name = %metadata.name,
            id = metadata.id,
            array_size = metadata.array_size,
            payload_size = metadata.payload_size,
            levels,
            %initial_epoch,
            "creating array storage"
        );

        let engine = std::sync::Arc::clone(context.engine());
        let pools = engine.pools();
        let mut grab_batch = RoundRobinGrabBatch::new(pools);

        // The offset interval a single page represents at each level.
        let mut offset_intervals = [0u64; MAX_LEVELS];
        offset_intervals[0] = records_per_leaf(metadata.payload_size);
        for level in 1..levels as usize {
            offset_intervals[level] = offset_intervals[level - 1] * INTERIOR_FANOUT as u64;
        }
        let leaf_pages = metadata
            .array_size
            .div_ceil(offset_intervals[0])
            .max(1);

        // Leftmost page of every level, bottom-up.
        let mut current_pages = [std::ptr::null_mut::<ArrayPage>(); MAX_LEVELS];
        let mut current_ids = [VolatilePointer::NULL; MAX_LEVELS];
        let mut current_records = [0u16; MAX_LEVELS];
        for level in 0..levels as usize {
            let pointer = grab_batch.grab()?;
            let page = pools.resolve(pointer).cast::<ArrayPage>();
            let range_end = offset_intervals[level].min(metadata.array_size);
            // SAFETY: freshly grabbed, unpublished page slot.
            unsafe {
                ArrayPage::initialize(
                    page,
                    initial_epoch,
                    metadata.id,
                    pointer,
                    metadata.payload_size,
                    level as u8,
                    (0, range_end),
                );
            }
            current_pages[level] = page;
            current_ids[level] = pointer;
            if level > 0 {
                // SAFETY: page initialized just above.
                let interior = unsafe { &*page };
                interior
                    .interior_record(0)
                    .set_volatile_relaxed(current_ids[level - 1].without_flags());
                current_records[level] = 1;
            }
        }

        // Then move on to the right.
        for _leaf in 1..leaf_pages {
            let pointer = grab_batch.grab()?;
            let page = pools.resolve(pointer).cast::<ArrayPage>();
            // SAFETY: current_pages[0] was initialized in this loop or above.
            let previous_end = unsafe { &*current_pages[0] }.range().1;
            let range = (
                previous_end,
                (previous_end + offset_intervals[0]).min(metadata.array_size),
            );
            // SAFETY: freshly grabbed, unpublished page slot.
            unsafe {
                ArrayPage::initialize(
                    page,
                    initial_epoch,
                    metadata.id,
                    pointer,
                    metadata.payload_size,
                    0,
                    range,
                );
            }
            current_pages[0] = page;
            current_ids[0] = pointer;

            // Push up to the parent, potentially up to the root.
            for level in 1..levels as usize {
                if usize::from(current_records[level]) == INTERIOR_FANOUT {
                    let interior_pointer = grab_batch.grab()?;
                    let interior = pools.resolve(interior_pointer).cast::<ArrayPage>();
                    // SAFETY: as above.
                    let previous_end = unsafe { &*current_pages[level] }.range().1;
                    let interior_range = (
                        previous_end,
                        (previous_end + offset_intervals[level]).min(metadata.array_size),
                    );
                    // SAFETY: freshly grabbed, unpublished page slot.
                    unsafe {
                        ArrayPage::initialize(
                            interior,
                            initial_epoch,
                            metadata.id,
                            interior_pointer,
                            metadata.payload_size,
                            level as u8,
                            interior_range,
                        );
                    }
                    // SAFETY: initialized just above.
                    unsafe { &*interior }
                        .interior_record(0)
                        .set_volatile_relaxed(current_ids[level - 1].without_flags());
                    current_pages[level] = interior;
                    current_ids[level] = interior_pointer;
                    current_records[level] = 1;
                    // The new interior also inserts into its parent.
                } else {
                    // SAFETY: initialized earlier in create.
                    unsafe { &*current_pages[level] }
                        .interior_record(usize::from(current_records[level]))
                        .set_volatile_relaxed(current_ids[level - 1].without_flags());
                    current_records[level] += 1;
                    break;
                }
            }
        }

        let root_pointer = DualPointer::new();
        root_pointer.set_volatile(current_ids[levels as usize - 1].without_flags());
        let route_finder = LookupRouteFinder::new(levels, metadata.payload_size);
        let mut metadata = metadata;
        metadata.root_page_id = root_pointer.volatile_pointer().word();
        Ok(Self {
            metadata,
            levels,
            route_finder,
            root_pointer,
            exists: AtomicBool::new(true),
        })
    }

    /// Release all volatile pages through a recursive release batch.
    pub(crate) fn release_pages(&self, pools: &PagePools) {
        let root = self.root_pointer.volatile_pointer();
        if root.is_null() {
            return;
        }
        let mut batch = PageReleaseBatch::new();
        release_recursive(pools, &mut batch, root);
        tracing::info!(name = %self.metadata.name, pages = batch.len(), "releasing array pages");
        batch.release_all(pools);
        self.root_pointer.clear();
    }

    // ========================================================================
    //  Lookup
    // ========================================================================

    fn locate<'a>(
        &self,
        context: &ThreadContext,
        offset: ArrayOffset,
    ) -> EngineResult<(&'a ArrayPage, u16)> {
        if offset >= self.metadata.array_size {
            return Err(ErrorCode::NotFound);
        }
        let route = self.route_finder.find_route(offset);
        let root = self.root_pointer.volatile_pointer();
        debug_assert!(!root.is_null());
        // SAFETY: the root page is live for the storage's lifetime.
        let mut current: &ArrayPage = unsafe { &*context.resolve(root).cast() };
        for level in (1..self.levels as usize).rev() {
            debug_assert!(current.contains(offset));
            let pointer = current
                .interior_record(usize::from(route[level]))
                .volatile_pointer();
            if pointer.is_null() {
                // Snapshot-only pointer: faulting it in belongs to the
                // snapshot subsystem.
                return Err(ErrorCode::NotImplemented);
            }
            // SAFETY: non-null interior pointers reference live pages of
            // this storage.
            current = unsafe { &*context.resolve(pointer).cast() };
        }
        debug_assert!(current.is_leaf());
        debug_assert!(current.contains(offset));
        Ok((current, (offset - current.range().0) as u16))
    }

    // ========================================================================
    //  Transactional operations
    // ========================================================================

    fn check_range(&self, payload_offset: u16, count: usize) -> EngineResult<()> {
        if usize::from(payload_offset) + count > usize::from(self.metadata.payload_size) {
            return Err(ErrorCode::TooShortPayload);
        }
        Ok(())
    }

    /// Read `payload.len()` bytes of the record at `offset`, starting at
    /// `payload_offset`.
    pub fn get_record(
        &self,
        context: &mut ThreadContext,
        offset: ArrayOffset,
        payload: &mut [u8],
        payload_offset: u16,
    ) -> EngineResult<()> {
        self.check_range(payload_offset, payload.len())?;
        let (page, index) = self.locate(context, offset)?;
        let owner = page.leaf_owner(index);
        let record = page.leaf_payload(index);
        context.xct_mut().optimistic_read(self.metadata.id, owner, |_observed| {
            // SAFETY: record covers payload_size bytes; the range was
            // checked above. Concurrent writers are detected by the
            // owner-id re-read.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    record.add(usize::from(payload_offset)),
                    payload.as_mut_ptr(),
                    payload.len(),
                );
            }
            Ok(())
        })
    }

    /// Typed read of a primitive at `payload_offset`.
    pub fn get_record_primitive<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        offset: ArrayOffset,
        payload_offset: u16,
    ) -> EngineResult<T> {
        let mut bytes = [0u8; 8];
        self.check_range(payload_offset, T::SIZE)?;
        let (page, index) = self.locate(context, offset)?;
        let owner = page.leaf_owner(index);
        let record = page.leaf_payload(index);
        context.xct_mut().optimistic_read(self.metadata.id, owner, |_observed| {
            // SAFETY: as in get_record.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    record.add(usize::from(payload_offset)),
                    bytes.as_mut_ptr(),
                    T::SIZE,
                );
            }
            Ok(())
        })?;
        Ok(T::from_payload_bytes(bytes))
    }

    /// Stage an overwrite of `payload.len()` bytes at `payload_offset`.
    pub fn overwrite_record(
        &self,
        context: &mut ThreadContext,
        offset: ArrayOffset,
        payload: &[u8],
        payload_offset: u16,
    ) -> EngineResult<()> {
        self.check_range(payload_offset, payload.len())?;
        let (page, index) = self.locate(context, offset)?;
        let owner = page.leaf_owner(index);
        let record = page.leaf_payload(index);
        let (xct, log_buffer) = context.xct_and_log();
        let log_index = log_buffer.reserve(RedoLog::ArrayOverwrite {
            storage_id: self.metadata.id,
            offset,
            payload_offset,
            data: payload.to_vec(),
        })?;
        xct.add_to_write_set(self.metadata.id, owner, record, log_index);
        Ok(())
    }

    /// Typed overwrite of a primitive at `payload_offset`.
    pub fn overwrite_record_primitive<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        offset: ArrayOffset,
        value: T,
        payload_offset: u16,
    ) -> EngineResult<()> {
        self.overwrite_record(
            context,
            offset,
            &value.to_payload_bytes()[..T::SIZE],
            payload_offset,
        )
    }

    /// Read, add `delta`, and stage the sum; returns the new value.
    ///
    /// The addition happens on a local copy: the read is re-performed on
    /// validation misses, so the accumulator must never mutate shared
    /// state until it succeeds.
    pub fn increment_record<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        offset: ArrayOffset,
        delta: T,
        payload_offset: u16,
    ) -> EngineResult<T> {
        let old: T = self.get_record_primitive(context, offset, payload_offset)?;
        let new = delta + old;
        self.overwrite_record_primitive(context, offset, new, payload_offset)?;
        Ok(new)
    }
}

fn release_recursive(pools: &PagePools, batch: &mut PageReleaseBatch, pointer: VolatilePointer) {
    // SAFETY: pointers reachable from a storage root reference live pages.
    let page: &ArrayPage = unsafe { &*pools.resolve(pointer).cast() };
    if !page.is_leaf() {
        for index in 0..INTERIOR_FANOUT {
            let child = page.interior_record(index).volatile_pointer();
            if !child.is_null() {
                release_recursive(pools, batch, child);
                page.interior_record(index).clear();
            }
        }
    }
    batch.release(pointer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_levels() {
        assert_eq!(calculate_levels(16, 8), 1);
        assert_eq!(calculate_levels(253, 8), 1);
        assert_eq!(calculate_levels(254, 8), 2);
        assert_eq!(calculate_levels(253 * 253, 8), 2);
        assert_eq!(calculate_levels(253 * 253 + 1, 8), 3);
    }

    #[test]
    fn test_route_finder() {
        let finder = LookupRouteFinder::new(2, 8);
        let route = finder.find_route(0);
        assert_eq!(route[0], 0);
        assert_eq!(route[1], 0);
        let route = finder.find_route(253);
        assert_eq!(route[0], 0);
        assert_eq!(route[1], 1);
        let route = finder.find_route(253 * 3 + 7);
        assert_eq!(route[0], 7);
        assert_eq!(route[1], 3);
    }
}
