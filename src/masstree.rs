//! Masstree: a layered B+tree-of-tries over variable-length byte keys.
//!
//! Keys are divided into 8-byte slices; each layer is a B+tree over one
//! slice. Border (leaf) pages hold records or next-layer pointers;
//! intermediate pages route through a two-level minipage fanout. Splits
//! publish a transient foster child that the next descending traversal
//! adopts into the parent (or that grows the tree at the root).
//!
//! All operations go through `locate_record` or `reserve_record`; at
//! call time they only append redo-log and write-set entries, and the
//! record's owner-id lock is taken only at precommit.

pub mod border;
pub mod intermediate;
mod split;
mod traverse;

use std::sync::atomic::{AtomicBool, AtomicU64};

use crate::error::{EngineResult, ErrorCode};
use crate::key::{
    key_suffix, remaining_length, slice_layer, slice_to_bytes, KeySlice, INFIMUM_SLICE,
    MAX_KEY_LENGTH, SUPREMUM_SLICE,
};
use crate::memory::{PagePools, PageReleaseBatch};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::page::{
    DualPointer, PageHeader, PageType, StorageId, VolatilePointer, VOLATILE_FLAG_SWAPPABLE,
};
use crate::storage::{MasstreeMetadata, Primitive};
use crate::thread::ThreadContext;
use crate::version::PageVersion;
use crate::xct::id::{XctId, MAX_ORDINAL};
use crate::xct::log::RedoLog;

use border::{BorderPage, FindKeyForReserve, BORDER_MAX_KEYS};
use intermediate::IntermediatePage;

/// Payload cap for a single masstree record.
pub const MASSTREE_MAX_PAYLOAD: usize = 1024;

// ============================================================================
//  MasstreePage (common page prefix)
// ============================================================================

/// The layout prefix shared by border and intermediate pages.
///
/// Both page types start with this exact struct, so a `*mut u8` from the
/// resolver can be viewed as a `MasstreePage` to read the version word
/// and fences before the page type is known.
#[repr(C)]
pub(crate) struct MasstreePage {
    header: PageHeader,
    low_fence: AtomicU64,
    high_fence: AtomicU64,
    foster_fence: AtomicU64,
    /// Volatile pointer word of the foster child; 0 = none.
    foster_child: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<MasstreePage>() == 56);

impl MasstreePage {
    /// Initialize the shared prefix in place.
    ///
    /// # Safety
    /// `self` must be exclusively owned and unpublished.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn initialize_prefix(
        &mut self,
        storage_id: StorageId,
        page_id: VolatilePointer,
        page_type: PageType,
        layer: u8,
        is_border: bool,
        is_root: bool,
        low_fence: KeySlice,
        high_fence: KeySlice,
        high_fence_supremum: bool,
    ) {
        self.header.initialize(storage_id, page_id, page_type, layer);
        self.header
            .version
            .initialize(is_border, is_root, high_fence_supremum);
        self.low_fence.store(low_fence, RELAXED);
        self.high_fence.store(high_fence, RELAXED);
        self.foster_fence.store(0, RELAXED);
        self.foster_child.store(0, RELAXED);
    }

    #[inline]
    pub(crate) fn version(&self) -> &PageVersion {
        &self.header.version
    }

    #[inline]
    pub(crate) fn layer(&self) -> u8 {
        self.header.level
    }

    #[inline]
    pub(crate) fn storage_id(&self) -> StorageId {
        self.header.storage_id
    }

    #[inline]
    pub(crate) fn self_pointer(&self) -> VolatilePointer {
        self.header.self_pointer()
    }

    #[inline]
    pub(crate) fn low_fence(&self) -> KeySlice {
        self.low_fence.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn high_fence(&self) -> KeySlice {
        self.high_fence.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn foster_fence(&self) -> KeySlice {
        self.foster_fence.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn foster_child_pointer(&self) -> VolatilePointer {
        VolatilePointer::from_word(self.foster_child.load(READ_ORD))
    }

    /// Whether `slice` is in this page's fence range.
    pub(crate) fn within_fences(&self, slice: KeySlice) -> bool {
        if slice < self.low_fence() {
            return false;
        }
        self.version().observe().is_high_fence_supremum() || slice < self.high_fence()
    }

    /// Whether `slice` is delegated to the foster child.
    pub(crate) fn within_foster_child(&self, slice: KeySlice) -> bool {
        self.version().observe().has_foster_child() && slice >= self.foster_fence()
    }

    /// Publish a foster link. The caller holds the page lock and sets the
    /// foster flag on its guard.
    pub(crate) fn set_foster(&self, fence: KeySlice, foster: VolatilePointer) {
        self.foster_fence.store(fence, WRITE_ORD);
        self.foster_child.store(foster.word(), WRITE_ORD);
    }

    /// Retire the foster link after adoption or root growth: the high
    /// fence collapses to the foster fence and the link is cleared. The
    /// caller holds the page lock and has already marked splitting.
    pub(crate) fn collapse_foster(&self, guard: &mut crate::version::VersionGuard<'_>) {
        debug_assert!(guard.snapshot().is_splitting());
        let fence = self.foster_fence.load(RELAXED);
        self.high_fence.store(fence, WRITE_ORD);
        guard.clear_high_fence_supremum();
        guard.clear_foster_child();
        self.foster_child.store(0, WRITE_ORD);
        self.foster_fence.store(0, WRITE_ORD);
    }
}

/// View a raw page as the shared prefix.
#[inline]
pub(crate) unsafe fn as_masstree_page<'a>(page: *mut u8) -> &'a MasstreePage {
    // SAFETY: caller guarantees `page` references an initialized
    // masstree page; both page types begin with MasstreePage.
    unsafe { &*page.cast::<MasstreePage>() }
}

/// View a raw page as a border page.
#[inline]
pub(crate) unsafe fn as_border<'a>(page: *mut u8) -> &'a BorderPage {
    // SAFETY: caller checked the border flag of the version word.
    unsafe { &*page.cast::<BorderPage>() }
}

/// View a raw page as an intermediate page.
#[inline]
pub(crate) unsafe fn as_intermediate<'a>(page: *mut u8) -> &'a IntermediatePage {
    // SAFETY: caller checked the border flag of the version word.
    unsafe { &*page.cast::<IntermediatePage>() }
}

// ============================================================================
//  MasstreeStorage
// ============================================================================

/// A masstree storage handle.
pub struct MasstreeStorage {
    metadata: MasstreeMetadata,
    first_root: DualPointer,
    exists: AtomicBool,
}

impl std::fmt::Debug for MasstreeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasstreeStorage")
            .field("id", &self.metadata.id)
            .field("name", &self.metadata.name)
            .finish_non_exhaustive()
    }
}

impl MasstreeStorage {
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
    pub fn metadata(&self) -> &MasstreeMetadata {
        &self.metadata
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
        self.first_root.volatile_pointer().word()
    }

    pub(crate) fn first_root(&self) -> &DualPointer {
        &self.first_root
    }

    // ========================================================================
    //  Creation / teardown
    // ========================================================================

    /// Create the storage with an empty first-layer root border page.
    pub(crate) fn create(
        context: &ThreadContext,
        metadata: MasstreeMetadata,
    ) -> EngineResult<Self> {
        debug_assert!(metadata.id > 0);
        let grabbed = context.grab_free_page()?;
        // The pointer to a root page might be swapped by root growth.
        let pointer = VolatilePointer::new(
            grabbed.node(),
            VOLATILE_FLAG_SWAPPABLE,
            0,
            grabbed.offset(),
        );
        let page = context.resolve(grabbed).cast::<BorderPage>();
        // SAFETY: freshly grabbed, unpublished page slot.
        unsafe {
            BorderPage::initialize(
                page,
                metadata.id,
                pointer,
                0,    // first layer
                true, // root
                INFIMUM_SLICE,
                SUPREMUM_SLICE,
                true, // high fence is the supremum sentinel
            );
        }
        let first_root = DualPointer::new();
        first_root.set_volatile(pointer);
        let mut metadata = metadata;
        metadata.root_page_id = pointer.word();
        tracing::info!(name = %metadata.name, id = metadata.id, "created masstree storage");
        Ok(Self {
            metadata,
            first_root,
            exists: AtomicBool::new(true),
        })
    }

    /// Release all volatile pages through a recursive release batch.
    pub(crate) fn release_pages(&self, pools: &PagePools) {
        let root = self.first_root.volatile_pointer();
        if root.is_null() {
            return;
        }
        let mut batch = PageReleaseBatch::new();
        release_recursive(pools, &mut batch, root);
        tracing::info!(name = %self.metadata.name, pages = batch.len(), "releasing masstree pages");
        batch.release_all(pools);
        self.first_root.clear();
    }

    // ========================================================================
    //  Record location
    // ========================================================================

    /// Descend to the border page and slot holding `key`.
    fn locate_record<'a>(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
    ) -> EngineResult<(&'a BorderPage, usize)> {
        let mut layer_root = self.get_first_root(context)?;
        let mut layer: u8 = 0;
        loop {
            let slice = slice_layer(key, layer as usize);
            let suffix = key_suffix(key, layer as usize);
            let remaining = remaining_length(key.len(), layer as usize);
            let (border, version) = self.find_border(context, layer_root, layer, slice)?;
            let count = version.key_count();
            match border.find_key(count, slice, suffix, remaining) {
                // TODO(range lock): a not-found result should leave a
                // node-set entry on the border so concurrent inserts
                // into the gap fail validation; phantom prevention is
                // future work.
                None => return Err(ErrorCode::NotFound),
                Some(index) if border.does_point_to_layer(index) => {
                    layer_root = self.follow_layer(context, border, index)?;
                    layer += 1;
                }
                Some(index) => return Ok((border, index)),
            }
        }
    }

    /// Descend to (or physically reserve) the slot for `key`, creating
    /// next layers and splitting border pages as needed.
    fn reserve_record<'a>(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload_count: usize,
    ) -> EngineResult<(&'a BorderPage, usize)> {
        let mut layer_root = self.get_first_root(context)?;
        let mut layer: u8 = 0;
        'layers: loop {
            let slice = slice_layer(key, layer as usize);
            let suffix = key_suffix(key, layer as usize);
            let remaining = remaining_length(key.len(), layer as usize);
            let (border, version) = self.find_border(context, layer_root, layer, slice)?;

            // Pre-lock fast path for existing matches.
            match border.find_key_for_reserve(0, version.key_count(), slice, suffix, remaining) {
                FindKeyForReserve::ExactMatchLayerPointer(index) => {
                    layer_root = self.follow_layer(context, border, index)?;
                    layer += 1;
                    continue 'layers;
                }
                FindKeyForReserve::ExactMatchLocalRecord(index) => {
                    return Ok((border, index));
                }
                _ => {}
            }

            // Lock and finalize: up to now, everything could happen.
            let mut guard = border.common().version().lock();
            if guard.snapshot().split_counter() != version.split_counter()
                || !border.common().within_fences(slice)
                || border.common().within_foster_child(slice)
            {
                drop(guard);
                return Err(ErrorCode::Retry);
            }

            // Rescan under the lock; new slots may have been appended
            // since the pre-lock count.
            let locked_count = guard.snapshot().key_count();
            match border.find_key_for_reserve(0, locked_count, slice, suffix, remaining) {
                FindKeyForReserve::ExactMatchLayerPointer(index) => {
                    drop(guard);
                    layer_root = self.follow_layer(context, border, index)?;
                    layer += 1;
                }
                FindKeyForReserve::ExactMatchLocalRecord(index) => {
                    drop(guard);
                    return Ok((border, index));
                }
                FindKeyForReserve::ConflictingLocalRecord(index) => {
                    drop(guard);
                    self.create_next_layer(context, border, index)?;
                    layer_root = self.follow_layer(context, border, index)?;
                    layer += 1;
                }
                FindKeyForReserve::NotFound => {
                    return self.reserve_new_record(
                        context,
                        border,
                        guard,
                        slice,
                        suffix,
                        remaining,
                        payload_count,
                    );
                }
            }
        }
    }

    /// Append a new, initially-deleted record; split the page first when
    /// it has no room.
    #[allow(clippy::too_many_arguments)]
    fn reserve_new_record<'a>(
        &self,
        context: &ThreadContext,
        border: &'a BorderPage,
        mut guard: crate::version::VersionGuard<'a>,
        slice: KeySlice,
        suffix: &[u8],
        remaining: usize,
        payload_count: usize,
    ) -> EngineResult<(&'a BorderPage, usize)> {
        let initial_id = XctId::new_clean(
            context.current_global_epoch(),
            0,
            context.thread_id(),
        )
        .with_deleted();

        let count = guard.snapshot().key_count();
        if border.can_accommodate(count, remaining, payload_count) {
            border.reserve_record(
                &mut guard,
                count,
                initial_id,
                slice,
                suffix,
                remaining,
                payload_count,
            );
            return Ok((border, count));
        }

        // All slots taken: recycle one whose record migrated away in an
        // earlier split before resorting to another split.
        if border.can_accommodate_data(remaining, payload_count) {
            if let Some(index) = border.find_reusable_slot(count) {
                border.reuse_moved_slot(
                    &mut guard,
                    index,
                    initial_id,
                    slice,
                    suffix,
                    remaining,
                    payload_count,
                );
                return Ok((border, index));
            }
        }

        // Have to split to make room. A page that still carries a foster
        // child is adopted by the next descent before it may split again.
        if guard.snapshot().has_foster_child() {
            drop(guard);
            return Err(ErrorCode::Retry);
        }
        let (foster, mut foster_guard) =
            split::split_foster_border(context, border, &mut guard, slice)?;
        let (target, target_guard): (&BorderPage, &mut crate::version::VersionGuard<'_>) =
            if slice >= border.common().foster_fence() {
                (foster, &mut foster_guard)
            } else {
                (border, &mut guard)
            };
        let target_count = target_guard.snapshot().key_count();
        if target.can_accommodate(target_count, remaining, payload_count) {
            target.reserve_record(
                target_guard,
                target_count,
                initial_id,
                slice,
                suffix,
                remaining,
                payload_count,
            );
            return Ok((target, target_count));
        }
        if target.can_accommodate_data(remaining, payload_count) {
            if let Some(index) = target.find_reusable_slot(target_count) {
                target.reuse_moved_slot(
                    target_guard,
                    index,
                    initial_id,
                    slice,
                    suffix,
                    remaining,
                    payload_count,
                );
                return Ok((target, index));
            }
        }
        // The record area itself is exhausted; reclaiming it needs the
        // snapshot/garbage-collection path.
        tracing::warn!("border page cannot accommodate record even after split");
        Err(ErrorCode::TooLongPayload {
            length: payload_count,
        })
    }

    /// Resolve a conflicting-local record by pushing it into a new layer.
    ///
    /// Runs as an independent system transaction under the record's
    /// owner-id lock; the parent slot is never demoted afterward.
    fn create_next_layer(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
    ) -> EngineResult<()> {
        let grabbed = context.grab_free_page()?;
        let pointer = VolatilePointer::new(
            grabbed.node(),
            VOLATILE_FLAG_SWAPPABLE,
            0,
            grabbed.offset(),
        );
        let root_raw = context.resolve(grabbed).cast::<BorderPage>();

        let owner = border.owner_id(index);
        let observed = owner.lock_unconditional();
        if border.does_point_to_layer(index) {
            // A concurrent thread already made this a next layer; our
            // effort was a waste, but the goal was achieved.
            tracing::debug!("concurrent thread already created the next layer");
            context.release_free_page(grabbed);
            owner.release_lock();
            return Ok(());
        }
        if observed.is_moved() {
            context.release_free_page(grabbed);
            owner.release_lock();
            return Err(ErrorCode::Retry);
        }

        // SAFETY: freshly grabbed, unpublished page slot.
        unsafe {
            BorderPage::initialize(
                root_raw,
                self.metadata.id,
                pointer,
                border.layer() + 1,
                true, // root of the new layer
                INFIMUM_SLICE,
                SUPREMUM_SLICE,
                true,
            );
        }
        // SAFETY: initialized just above.
        let root = unsafe { &*root_raw };
        {
            let mut root_guard = root.common().version().lock();
            root.copy_initial_record(&mut root_guard, border, index);
        }
        border.set_next_layer(index, pointer);

        // Bump the ordinal so other transactions become aware of the
        // change at commit time; wrap into the next epoch on overflow.
        // This is a system transaction that changes nothing logically.
        let mut unlocked = observed.without_lock();
        let ordinal = unlocked.ordinal();
        unlocked = if ordinal != MAX_ORDINAL {
            unlocked.with_epoch_ordinal(unlocked.epoch(), ordinal + 1)
        } else {
            unlocked.with_epoch_ordinal(unlocked.epoch().one_more(), 0)
        };
        // As a pointer, the slot is now active even if the record it
        // carried was deleted.
        unlocked = unlocked.without_deleted();
        owner.publish(unlocked);
        Ok(())
    }

    // ========================================================================
    //  Record operations (staging)
    // ========================================================================

    fn retrieve_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        payload: &mut [u8],
    ) -> EngineResult<u16> {
        let owner = border.owner_id(index);
        let mut result_length: u16 = 0;
        context
            .xct_mut()
            .optimistic_read(self.metadata.id, owner, |observed| {
                if border.does_point_to_layer(index) {
                    return Err(ErrorCode::Retry);
                }
                if observed.is_deleted() {
                    return Err(ErrorCode::NotFound);
                }
                let length = usize::from(border.payload_length(index));
                if length > payload.len() {
                    return Err(ErrorCode::BufferTooSmall {
                        required: length,
                        capacity: payload.len(),
                    });
                }
                // SAFETY: the record area holds `length` payload bytes;
                // consistency is validated by the owner-id re-read.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        border.record_payload(index),
                        payload.as_mut_ptr(),
                        length,
                    );
                }
                result_length = length as u16;
                Ok(())
            })?;
        Ok(result_length)
    }

    fn retrieve_part_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        payload: &mut [u8],
        payload_offset: u16,
    ) -> EngineResult<()> {
        let owner = border.owner_id(index);
        context
            .xct_mut()
            .optimistic_read(self.metadata.id, owner, |observed| {
                if border.does_point_to_layer(index) {
                    return Err(ErrorCode::Retry);
                }
                if observed.is_deleted() {
                    return Err(ErrorCode::NotFound);
                }
                let stored = usize::from(border.payload_length(index));
                if stored < usize::from(payload_offset) + payload.len() {
                    return Err(ErrorCode::TooShortPayload);
                }
                // SAFETY: as in retrieve_general, range checked above.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        border.record_payload(index).add(usize::from(payload_offset)),
                        payload.as_mut_ptr(),
                        payload.len(),
                    );
                }
                Ok(())
            })
    }

    fn insert_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        key: &[u8],
        payload: &[u8],
    ) -> EngineResult<()> {
        let owner = border.owner_id(index);
        context
            .xct_mut()
            .optimistic_read(self.metadata.id, owner, |observed| {
                if border.does_point_to_layer(index) {
                    return Err(ErrorCode::Retry);
                }
                if !observed.is_deleted() {
                    return Err(ErrorCode::AlreadyExists(format!(
                        "key in storage {:?}",
                        self.metadata.name
                    )));
                }
                if usize::from(border.payload_length(index)) < payload.len() {
                    // The reserved record area is smaller than the new
                    // payload; a delete-then-insert cycle cannot grow it.
                    return Err(ErrorCode::TooLongPayload {
                        length: payload.len(),
                    });
                }
                Ok(())
            })?;
        let layer = border.layer();
        let record = border.record_payload(index);
        let (xct, log_buffer) = context.xct_and_log();
        let log_index = log_buffer.reserve(RedoLog::MasstreeInsert {
            storage_id: self.metadata.id,
            key: key.to_vec(),
            layer,
            data: payload.to_vec(),
        })?;
        xct.add_to_write_set(self.metadata.id, owner, record, log_index);
        Ok(())
    }

    fn delete_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        key: &[u8],
    ) -> EngineResult<()> {
        let owner = border.owner_id(index);
        context
            .xct_mut()
            .optimistic_read(self.metadata.id, owner, |observed| {
                if border.does_point_to_layer(index) {
                    return Err(ErrorCode::Retry);
                }
                if observed.is_deleted() {
                    return Err(ErrorCode::NotFound);
                }
                Ok(())
            })?;
        let layer = border.layer();
        let record = border.record_payload(index);
        let (xct, log_buffer) = context.xct_and_log();
        let log_index = log_buffer.reserve(RedoLog::MasstreeDelete {
            storage_id: self.metadata.id,
            key: key.to_vec(),
            layer,
        })?;
        xct.add_to_write_set(self.metadata.id, owner, record, log_index);
        Ok(())
    }

    fn overwrite_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        key: &[u8],
        payload: &[u8],
        payload_offset: u16,
    ) -> EngineResult<()> {
        let owner = border.owner_id(index);
        context
            .xct_mut()
            .optimistic_read(self.metadata.id, owner, |observed| {
                if border.does_point_to_layer(index) {
                    return Err(ErrorCode::Retry);
                }
                if observed.is_deleted() {
                    return Err(ErrorCode::NotFound);
                }
                if usize::from(border.payload_length(index))
                    < usize::from(payload_offset) + payload.len()
                {
                    return Err(ErrorCode::TooShortPayload);
                }
                Ok(())
            })?;
        let layer = border.layer();
        let record = border.record_payload(index);
        let (xct, log_buffer) = context.xct_and_log();
        let log_index = log_buffer.reserve(RedoLog::MasstreeOverwrite {
            storage_id: self.metadata.id,
            key: key.to_vec(),
            layer,
            payload_offset,
            data: payload.to_vec(),
        })?;
        xct.add_to_write_set(self.metadata.id, owner, record, log_index);
        Ok(())
    }

    /// Read, add, and stage the sum as an overwrite; returns the new
    /// value. The read must be re-performed locally on retries, so the
    /// addition never touches shared state until it succeeds.
    fn increment_general<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        key: &[u8],
        delta: T,
        payload_offset: u16,
    ) -> EngineResult<T> {
        let mut bytes = [0u8; 8];
        self.retrieve_part_general(
            context,
            border,
            index,
            &mut bytes[..T::SIZE],
            payload_offset,
        )?;
        let new = delta + T::from_payload_bytes(bytes);
        self.overwrite_general(
            context,
            border,
            index,
            key,
            &new.to_payload_bytes()[..T::SIZE],
            payload_offset,
        )?;
        Ok(new)
    }

    // ========================================================================
    //  Public API: variable-length keys
    // ========================================================================

    fn check_key(&self, key: &[u8]) -> EngineResult<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(ErrorCode::TooLongPayload { length: key.len() });
        }
        Ok(())
    }

    /// Read the whole payload of `key` into `payload`; returns the
    /// stored payload length.
    pub fn get_record(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload: &mut [u8],
    ) -> EngineResult<u16> {
        self.check_key(key)?;
        loop {
            let (border, index) = match self.locate_record(context, key) {
                Err(ErrorCode::Retry) => continue,
                other => other?,
            };
            match self.retrieve_general(context, border, index, payload) {
                Err(ErrorCode::Retry) => continue,
                other => return other,
            }
        }
    }

    /// Read `payload.len()` bytes starting at `payload_offset`.
    pub fn get_record_part(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload: &mut [u8],
        payload_offset: u16,
    ) -> EngineResult<()> {
        self.check_key(key)?;
        loop {
            let (border, index) = match self.locate_record(context, key) {
                Err(ErrorCode::Retry) => continue,
                other => other?,
            };
            match self.retrieve_part_general(context, border, index, payload, payload_offset) {
                Err(ErrorCode::Retry) => continue,
                other => return other,
            }
        }
    }

    /// Typed read of a primitive at `payload_offset`.
    pub fn get_record_primitive<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload_offset: u16,
    ) -> EngineResult<T> {
        let mut bytes = [0u8; 8];
        self.get_record_part(context, key, &mut bytes[..T::SIZE], payload_offset)?;
        Ok(T::from_payload_bytes(bytes))
    }

    /// Insert a new record. `AlreadyExists` if the key is live.
    pub fn insert_record(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload: &[u8],
    ) -> EngineResult<()> {
        self.check_key(key)?;
        if payload.len() > MASSTREE_MAX_PAYLOAD
            || !BorderPage::fits_in_empty(key.len(), payload.len())
        {
            return Err(ErrorCode::TooLongPayload {
                length: payload.len(),
            });
        }
        loop {
            let (border, index) = match self.reserve_record(context, key, payload.len()) {
                Err(ErrorCode::Retry) => continue,
                other => other?,
            };
            match self.insert_general(context, border, index, key, payload) {
                Err(ErrorCode::Retry) => continue,
                other => return other,
            }
        }
    }

    /// Logically delete a record.
    pub fn delete_record(&self, context: &mut ThreadContext, key: &[u8]) -> EngineResult<()> {
        self.check_key(key)?;
        loop {
            let (border, index) = match self.locate_record(context, key) {
                Err(ErrorCode::Retry) => continue,
                other => other?,
            };
            match self.delete_general(context, border, index, key) {
                Err(ErrorCode::Retry) => continue,
                other => return other,
            }
        }
    }

    /// Overwrite part of an existing record's payload.
    pub fn overwrite_record(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload: &[u8],
        payload_offset: u16,
    ) -> EngineResult<()> {
        self.check_key(key)?;
        loop {
            let (border, index) = match self.locate_record(context, key) {
                Err(ErrorCode::Retry) => continue,
                other => other?,
            };
            match self.overwrite_general(context, border, index, key, payload, payload_offset) {
                Err(ErrorCode::Retry) => continue,
                other => return other,
            }
        }
    }

    /// Typed overwrite of a primitive at `payload_offset`.
    pub fn overwrite_record_primitive<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        value: T,
        payload_offset: u16,
    ) -> EngineResult<()> {
        self.overwrite_record(
            context,
            key,
            &value.to_payload_bytes()[..T::SIZE],
            payload_offset,
        )
    }

    /// Atomically (within the transaction) add `delta` to a primitive
    /// payload; returns the new value.
    pub fn increment_record<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        delta: T,
        payload_offset: u16,
    ) -> EngineResult<T> {
        self.check_key(key)?;
        loop {
            let (border, index) = match self.locate_record(context, key) {
                Err(ErrorCode::Retry) => continue,
                other => other?,
            };
            match self.increment_general(context, border, index, key, delta, payload_offset) {
                Err(ErrorCode::Retry) => continue,
                other => return other,
            }
        }
    }

    // ========================================================================
    //  Public API: 8-byte normalized keys
    // ========================================================================

    /// Read a record with an 8-byte normalized key.
    pub fn get_record_normalized(
        &self,
        context: &mut ThreadContext,
        key: KeySlice,
        payload: &mut [u8],
    ) -> EngineResult<u16> {
        self.get_record(context, &slice_to_bytes(key), payload)
    }

    /// Typed read with an 8-byte normalized key.
    pub fn get_record_primitive_normalized<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        key: KeySlice,
        payload_offset: u16,
    ) -> EngineResult<T> {
        self.get_record_primitive(context, &slice_to_bytes(key), payload_offset)
    }

    /// Insert with an 8-byte normalized key.
    pub fn insert_record_normalized(
        &self,
        context: &mut ThreadContext,
        key: KeySlice,
        payload: &[u8],
    ) -> EngineResult<()> {
        self.insert_record(context, &slice_to_bytes(key), payload)
    }

    /// Delete with an 8-byte normalized key.
    pub fn delete_record_normalized(
        &self,
        context: &mut ThreadContext,
        key: KeySlice,
    ) -> EngineResult<()> {
        self.delete_record(context, &slice_to_bytes(key))
    }

    /// Overwrite with an 8-byte normalized key.
    pub fn overwrite_record_normalized(
        &self,
        context: &mut ThreadContext,
        key: KeySlice,
        payload: &[u8],
        payload_offset: u16,
    ) -> EngineResult<()> {
        self.overwrite_record(context, &slice_to_bytes(key), payload, payload_offset)
    }

    /// Typed overwrite with an 8-byte normalized key.
    pub fn overwrite_record_primitive_normalized<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        key: KeySlice,
        value: T,
        payload_offset: u16,
    ) -> EngineResult<()> {
        self.overwrite_record_primitive(context, &slice_to_bytes(key), value, payload_offset)
    }

    /// Increment with an 8-byte normalized key.
    pub fn increment_record_normalized<T: Primitive>(
        &self,
        context: &mut ThreadContext,
        key: KeySlice,
        delta: T,
        payload_offset: u16,
    ) -> EngineResult<T> {
        self.increment_record(context, &slice_to_bytes(key), delta, payload_offset)
    }
}

// ============================================================================
//  Page release
// ============================================================================

fn release_recursive(pools: &PagePools, batch: &mut PageReleaseBatch, pointer: VolatilePointer) {
    // SAFETY: pointers reachable from a storage root reference live pages.
    let page = unsafe { as_masstree_page(pools.resolve(pointer)) };
    let version = page.version().stable();
    let foster = page.foster_child_pointer();
    if !foster.is_null() {
        release_recursive(pools, batch, foster);
    }
    if version.is_border() {
        // SAFETY: border flag checked.
        let border = unsafe { as_border(pools.resolve(pointer)) };
        for index in 0..version.key_count().min(BORDER_MAX_KEYS) {
            if border.does_point_to_layer(index) {
                let child = border.next_layer_pointer(index).volatile_pointer();
                if !child.is_null() {
                    release_recursive(pools, batch, child);
                }
            }
        }
    } else {
        // SAFETY: border flag checked.
        let inter = unsafe { as_intermediate(pools.resolve(pointer)) };
        for mini_index in 0..=version.key_count() {
            let mini = inter.minipage(mini_index);
            let mini_count = mini.version().stable().key_count();
            for pointer_index in 0..=mini_count {
                let child = mini.pointer(pointer_index).volatile_pointer();
                if !child.is_null() {
                    release_recursive(pools, batch, child);
                }
            }
        }
    }
    batch.release(pointer);
}
