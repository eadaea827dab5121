//! Masstree border (leaf) pages.
//!
//! A border page owns the records within its fence range, except those
//! delegated to its foster child. Slots are append-only until a split:
//! parallel arrays hold {slice, remaining key length, payload length,
//! data offset, owner id}, and a contiguous record area at the page tail
//! holds each slot's `[suffix][payload]` bytes. A slot whose remaining
//! length is the next-layer sentinel holds a [`DualPointer`] to the next
//! layer's root instead of a record.
//!
//! A slot's suffix bytes are immutable once inserted; the owner-id's
//! `deleted` flag indicates the record is logically absent.

use std::cell::UnsafeCell;

use crate::key::{KeySlice, SLICE_SIZE};
use crate::page::{DualPointer, PageType, StorageId, VolatilePointer, PAGE_SIZE};
use crate::version::VersionGuard;
use crate::xct::id::{OwnerId, XctId};

use super::MasstreePage;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8};

/// Slots per border page.
pub const BORDER_MAX_KEYS: usize = 32;

/// Remaining-length value marking a next-layer pointer slot.
pub const NEXT_LAYER_SENTINEL: u8 = 0xFF;

/// Byte size of the fixed fields before the record area.
const BORDER_FIXED: usize = 736;

/// Byte size of the record area.
pub const BORDER_DATA_SIZE: usize = PAGE_SIZE - BORDER_FIXED;

/// Minimum record allocation: room to later hold a next-layer pointer.
const MIN_RECORD_BYTES: usize = std::mem::size_of::<DualPointer>();

#[inline]
const fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Suffix bytes a record with this remaining length stores.
#[inline]
const fn suffix_length(remaining: usize) -> usize {
    if remaining > SLICE_SIZE {
        remaining - SLICE_SIZE
    } else {
        0
    }
}

/// Record-area bytes a (remaining, payload) pair occupies.
#[inline]
const fn record_size(remaining: usize, payload: usize) -> usize {
    let bytes = align8(suffix_length(remaining)) + align8(payload);
    if bytes < MIN_RECORD_BYTES {
        MIN_RECORD_BYTES
    } else {
        bytes
    }
}

/// Result of scanning for a key with write intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindKeyForReserve {
    /// The slot holds exactly this key.
    ExactMatchLocalRecord(usize),
    /// The slot is a next-layer pointer for this slice.
    ExactMatchLayerPointer(usize),
    /// The slot shares the slice with a different suffix; a next layer
    /// must be created.
    ConflictingLocalRecord(usize),
    /// No matching or conflicting slot.
    NotFound,
}

// ============================================================================
//  BorderPage
// ============================================================================

/// A masstree border page.
#[repr(C)]
pub struct BorderPage {
    common: MasstreePage,
    /// Cursor into the record area; mutated only under the page lock.
    next_data_offset: AtomicU16,
    _pad0: [u8; 6],
    slices: [AtomicU64; BORDER_MAX_KEYS],
    owner_ids: [OwnerId; BORDER_MAX_KEYS],
    remaining_lengths: [AtomicU8; BORDER_MAX_KEYS],
    payload_lengths: [AtomicU16; BORDER_MAX_KEYS],
    data_offsets: [AtomicU16; BORDER_MAX_KEYS],
    data: UnsafeCell<[u8; BORDER_DATA_SIZE]>,
}

const _: () = assert!(std::mem::size_of::<BorderPage>() == PAGE_SIZE);

impl BorderPage {
    /// Initialize a border page in place.
    ///
    /// # Safety
    /// `page` must point at an exclusive, unpublished page slot.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn initialize(
        page: *mut Self,
        storage_id: StorageId,
        page_id: VolatilePointer,
        layer: u8,
        root: bool,
        low_fence: KeySlice,
        high_fence: KeySlice,
        high_fence_supremum: bool,
    ) {
        // SAFETY: exclusive access per the contract.
        unsafe {
            let this = &mut *page;
            this.common.initialize_prefix(
                storage_id,
                page_id,
                PageType::MasstreeBorder,
                layer,
                true,
                root,
                low_fence,
                high_fence,
                high_fence_supremum,
            );
            this.next_data_offset = AtomicU16::new(0);
        }
    }

    #[inline]
    pub(crate) fn common(&self) -> &MasstreePage {
        &self.common
    }

    #[inline]
    pub(crate) fn layer(&self) -> u8 {
        self.common.layer()
    }

    // ========================================================================
    //  Slot accessors
    // ========================================================================

    #[inline]
    pub(crate) fn slice(&self, index: usize) -> KeySlice {
        self.slices[index].load(READ_ORD)
    }

    #[inline]
    pub(crate) fn remaining_length(&self, index: usize) -> u8 {
        self.remaining_lengths[index].load(READ_ORD)
    }

    #[inline]
    pub(crate) fn payload_length(&self, index: usize) -> u16 {
        self.payload_lengths[index].load(READ_ORD)
    }

    #[inline]
    pub(crate) fn owner_id(&self, index: usize) -> &OwnerId {
        &self.owner_ids[index]
    }

    /// Whether the slot points to the next layer instead of a record.
    #[inline]
    pub(crate) fn does_point_to_layer(&self, index: usize) -> bool {
        self.remaining_length(index) == NEXT_LAYER_SENTINEL
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        self.data.get().cast::<u8>()
    }

    /// The slot's suffix bytes (empty for slice-only keys).
    pub(crate) fn suffix(&self, index: usize) -> &[u8] {
        let remaining = usize::from(self.remaining_length(index));
        debug_assert_ne!(remaining, usize::from(NEXT_LAYER_SENTINEL));
        let length = suffix_length(remaining);
        let offset = usize::from(self.data_offsets[index].load(READ_ORD));
        // SAFETY: the record at `offset` begins with `length` suffix
        // bytes, immutable once the slot is published.
        unsafe { std::slice::from_raw_parts(self.data_ptr().add(offset), length) }
    }

    /// Address of the slot's payload bytes.
    pub(crate) fn record_payload(&self, index: usize) -> *mut u8 {
        let remaining = usize::from(self.remaining_length(index));
        let offset = usize::from(self.data_offsets[index].load(READ_ORD));
        // SAFETY: payload follows the 8-byte-aligned suffix.
        unsafe {
            self.data_ptr()
                .add(offset + align8(suffix_length(remaining)))
        }
    }

    /// The next-layer pointer stored in the slot's record area.
    pub(crate) fn next_layer_pointer(&self, index: usize) -> &DualPointer {
        let offset = usize::from(self.data_offsets[index].load(READ_ORD));
        // SAFETY: next-layer slots hold a DualPointer at the 8-aligned
        // record base; MIN_RECORD_BYTES guarantees the room.
        unsafe { &*self.data_ptr().add(offset).cast::<DualPointer>() }
    }

    /// Convert a record slot into a next-layer pointer. The caller holds
    /// the slot's owner-id lock; the slot is never demoted back.
    pub(crate) fn set_next_layer(&self, index: usize, pointer: VolatilePointer) {
        let dual = self.next_layer_pointer(index);
        dual.set_snapshot_id(0);
        dual.set_volatile(pointer);
        // The sentinel is published after the pointer so a reader that
        // observes it reads a valid pointer.
        self.remaining_lengths[index].store(NEXT_LAYER_SENTINEL, WRITE_ORD);
    }

    // ========================================================================
    //  Key search
    // ========================================================================

    /// Linear scan for `slice`/`suffix` among slots `0..count`.
    ///
    /// Returns the matching record slot, or the next-layer slot when the
    /// query has more bytes than the slice.
    pub(crate) fn find_key(
        &self,
        count: usize,
        slice: KeySlice,
        suffix: &[u8],
        remaining: usize,
    ) -> Option<usize> {
        debug_assert!(count <= BORDER_MAX_KEYS);
        for index in 0..count {
            if self.slice(index) != slice {
                continue;
            }
            let stored = usize::from(self.remaining_length(index));
            if stored == usize::from(NEXT_LAYER_SENTINEL) {
                if remaining > SLICE_SIZE {
                    return Some(index);
                }
                continue;
            }
            if remaining <= SLICE_SIZE {
                if stored == remaining {
                    return Some(index);
                }
                continue;
            }
            if stored == remaining && self.suffix(index) == suffix {
                return Some(index);
            }
        }
        None
    }

    /// Scan for `slice`/`suffix` with write intent, classifying the
    /// outcome for `reserve_record`.
    pub(crate) fn find_key_for_reserve(
        &self,
        from: usize,
        to: usize,
        slice: KeySlice,
        suffix: &[u8],
        remaining: usize,
    ) -> FindKeyForReserve {
        debug_assert!(to <= BORDER_MAX_KEYS);
        for index in from..to {
            if self.slice(index) != slice {
                continue;
            }
            let stored = usize::from(self.remaining_length(index));
            if stored == usize::from(NEXT_LAYER_SENTINEL) {
                if remaining > SLICE_SIZE {
                    return FindKeyForReserve::ExactMatchLayerPointer(index);
                }
                continue;
            }
            if remaining <= SLICE_SIZE {
                if stored == remaining {
                    return FindKeyForReserve::ExactMatchLocalRecord(index);
                }
                continue;
            }
            if stored <= SLICE_SIZE {
                continue;
            }
            if stored == remaining && self.suffix(index) == suffix {
                return FindKeyForReserve::ExactMatchLocalRecord(index);
            }
            // Same slice, different suffix: both keys need a next layer.
            return FindKeyForReserve::ConflictingLocalRecord(index);
        }
        FindKeyForReserve::NotFound
    }

    // ========================================================================
    //  Reservation
    // ========================================================================

    /// Whether a new (remaining, payload) record fits.
    pub(crate) fn can_accommodate(
        &self,
        count: usize,
        remaining: usize,
        payload_count: usize,
    ) -> bool {
        count < BORDER_MAX_KEYS
            && usize::from(self.next_data_offset.load(RELAXED))
                + record_size(remaining, payload_count)
                <= BORDER_DATA_SIZE
    }

    /// Whether a new record's bytes fit in the record area, ignoring the
    /// slot count. Used when recycling a migrated-away slot.
    pub(crate) fn can_accommodate_data(&self, remaining: usize, payload_count: usize) -> bool {
        usize::from(self.next_data_offset.load(RELAXED)) + record_size(remaining, payload_count)
            <= BORDER_DATA_SIZE
    }

    /// Whether the record would fit even in an empty page.
    pub(crate) fn fits_in_empty(remaining: usize, payload_count: usize) -> bool {
        record_size(remaining, payload_count) <= BORDER_DATA_SIZE
    }

    /// A slot whose record migrated to a foster child in an earlier
    /// split, available for recycling.
    pub(crate) fn find_reusable_slot(&self, count: usize) -> Option<usize> {
        (0..count).find(|&index| self.owner_ids[index].load().is_moved())
    }

    /// Allocate record-area bytes. Only under the page lock.
    fn allocate_data(&self, bytes: usize) -> u16 {
        let offset = self.next_data_offset.load(RELAXED);
        debug_assert!(usize::from(offset) + bytes <= BORDER_DATA_SIZE);
        self.next_data_offset
            .store(offset + bytes as u16, RELAXED);
        offset
    }

    /// Write a slot's arrays and record bytes. The owner id is published
    /// last (release) so a reader that observes the new id also sees the
    /// new slot fields.
    fn write_slot(
        &self,
        index: usize,
        initial_owner: XctId,
        slice: KeySlice,
        suffix: &[u8],
        remaining: usize,
        payload_count: usize,
    ) {
        debug_assert_eq!(suffix.len(), suffix_length(remaining));
        let offset = self.allocate_data(record_size(remaining, payload_count));
        // SAFETY: the allocation above reserved this exclusive range of
        // the record area; the page lock keeps it private.
        unsafe {
            let base = self.data_ptr().add(usize::from(offset));
            std::ptr::copy_nonoverlapping(suffix.as_ptr(), base, suffix.len());
            std::ptr::write_bytes(base.add(align8(suffix.len())), 0, align8(payload_count));
        }
        self.slices[index].store(slice, RELAXED);
        self.remaining_lengths[index].store(remaining as u8, RELAXED);
        self.payload_lengths[index].store(payload_count as u16, RELAXED);
        self.data_offsets[index].store(offset, RELAXED);
        self.owner_ids[index].publish(initial_owner);
    }

    /// Append a new slot at `index` (== the current key count).
    ///
    /// The slot is born with an initially-deleted owner id and a zeroed
    /// payload area; it becomes visible at the guard's unlock, through
    /// the incremented key count.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reserve_record(
        &self,
        guard: &mut VersionGuard<'_>,
        index: usize,
        initial_owner: XctId,
        slice: KeySlice,
        suffix: &[u8],
        remaining: usize,
        payload_count: usize,
    ) {
        debug_assert!(guard.locks(self.common.version()));
        debug_assert!(initial_owner.is_deleted());
        debug_assert_eq!(index, guard.snapshot().key_count());
        debug_assert!(self.can_accommodate(index, remaining, payload_count));
        self.write_slot(index, initial_owner, slice, suffix, remaining, payload_count);
        guard.increment_key_count();
    }

    /// Recycle a migrated-away slot for a new key.
    ///
    /// Safe under the optimistic protocol: every staged write carries a
    /// read-set observation of the old owner id, and the rewritten word
    /// always differs (the fresh id is deleted-reserved), so any stale
    /// observer fails validation. The inserting mark is published before
    /// the rewrite so in-flight scans retry.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reuse_moved_slot(
        &self,
        guard: &mut VersionGuard<'_>,
        index: usize,
        initial_owner: XctId,
        slice: KeySlice,
        suffix: &[u8],
        remaining: usize,
        payload_count: usize,
    ) {
        debug_assert!(guard.locks(self.common.version()));
        debug_assert!(initial_owner.is_deleted());
        debug_assert!(index < guard.snapshot().key_count());
        debug_assert!(self.owner_ids[index].load().is_moved());
        debug_assert!(self.can_accommodate_data(remaining, payload_count));
        guard.mark_inserting();
        self.write_slot(index, initial_owner, slice, suffix, remaining, payload_count);
    }

    /// Copy a slot from `source` during a foster split. The destination
    /// page is locked and unpublished; the source slot's owner-id lock is
    /// held by the splitter.
    pub(crate) fn migrate_slot(
        &self,
        guard: &mut VersionGuard<'_>,
        index: usize,
        source: &BorderPage,
        source_index: usize,
        owner: XctId,
    ) {
        debug_assert!(guard.locks(self.common.version()));
        debug_assert!(!owner.is_locked() && !owner.is_moved());
        let slice = source.slice(source_index);
        let stored = source.remaining_length(source_index);
        self.slices[index].store(slice, RELAXED);

        if stored == NEXT_LAYER_SENTINEL {
            let offset = self.allocate_data(MIN_RECORD_BYTES);
            self.data_offsets[index].store(offset, RELAXED);
            self.payload_lengths[index].store(0, RELAXED);
            // Copy the layer pointer, then publish the sentinel.
            let source_dual = source.next_layer_pointer(source_index);
            // SAFETY: allocated range is exclusive to this unpublished page.
            let dual = unsafe {
                &*self
                    .data_ptr()
                    .add(usize::from(offset))
                    .cast::<DualPointer>()
            };
            dual.copy_from(source_dual);
            self.remaining_lengths[index].store(NEXT_LAYER_SENTINEL, RELAXED);
        } else {
            let remaining = usize::from(stored);
            let payload_count = usize::from(source.payload_length(source_index));
            let offset = self.allocate_data(record_size(remaining, payload_count));
            // SAFETY: both ranges are in-bounds; the source record is
            // frozen by its owner-id lock.
            unsafe {
                let base = self.data_ptr().add(usize::from(offset));
                std::ptr::copy_nonoverlapping(
                    source.suffix(source_index).as_ptr(),
                    base,
                    suffix_length(remaining),
                );
                std::ptr::copy_nonoverlapping(
                    source.record_payload(source_index),
                    base.add(align8(suffix_length(remaining))),
                    payload_count,
                );
            }
            self.remaining_lengths[index].store(stored, RELAXED);
            self.payload_lengths[index].store(payload_count as u16, RELAXED);
            self.data_offsets[index].store(offset, RELAXED);
        }
        self.owner_ids[index].store_relaxed(owner);
    }

    /// Seed a fresh next-layer root with the record it takes over from
    /// `parent`. The new root is locked and unpublished; the parent slot's
    /// owner-id lock is held by the caller.
    pub(crate) fn copy_initial_record(
        &self,
        guard: &mut VersionGuard<'_>,
        parent: &BorderPage,
        parent_index: usize,
    ) {
        debug_assert!(guard.locks(self.common.version()));
        debug_assert_eq!(guard.snapshot().key_count(), 0);
        let parent_remaining = usize::from(parent.remaining_length(parent_index));
        debug_assert!(parent_remaining > SLICE_SIZE);
        let parent_suffix = parent.suffix(parent_index);
        let remaining = parent_remaining - SLICE_SIZE;
        let slice = crate::key::read_slice(parent_suffix, 0);
        let suffix = if parent_suffix.len() > SLICE_SIZE {
            &parent_suffix[SLICE_SIZE..]
        } else {
            &[]
        };
        let payload_count = usize::from(parent.payload_length(parent_index));

        let offset = self.allocate_data(record_size(remaining, payload_count));
        // SAFETY: exclusive unpublished page; the parent record is frozen
        // by its owner-id lock.
        unsafe {
            let base = self.data_ptr().add(usize::from(offset));
            std::ptr::copy_nonoverlapping(suffix.as_ptr(), base, suffix.len());
            std::ptr::copy_nonoverlapping(
                parent.record_payload(parent_index),
                base.add(align8(suffix.len())),
                payload_count,
            );
        }
        self.slices[0].store(slice, RELAXED);
        self.remaining_lengths[0].store(remaining as u8, RELAXED);
        self.payload_lengths[0].store(payload_count as u16, RELAXED);
        self.data_offsets[0].store(offset, RELAXED);
        // The new record keeps the parent's owner id (sans lock), deleted
        // flag included: nothing changed logically.
        self.owner_ids[0].store_relaxed(parent.owner_id(parent_index).load().without_lock());
        guard.set_key_count(1);
        guard.mark_inserting();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;
    use crate::key::{slice_layer, INFIMUM_SLICE, SUPREMUM_SLICE};
    use crate::memory::PagePools;

    fn make_border(pools: &PagePools) -> &'static BorderPage {
        let pointer = pools.grab_on(0).unwrap();
        let raw = pools.resolve(pointer).cast::<BorderPage>();
        unsafe {
            BorderPage::initialize(
                raw,
                1,
                pointer,
                0,
                true,
                INFIMUM_SLICE,
                SUPREMUM_SLICE,
                true,
            );
        }
        unsafe { &*raw }
    }

    fn reserve(border: &BorderPage, key: &[u8], payload_count: usize) -> usize {
        let slice = slice_layer(key, 0);
        let suffix = crate::key::key_suffix(key, 0);
        let remaining = key.len();
        let mut guard = border.common().version().lock();
        let index = guard.snapshot().key_count();
        let owner = XctId::new_clean(Epoch::INITIAL, 0, 0).with_deleted();
        border.reserve_record(&mut guard, index, owner, slice, suffix, remaining, payload_count);
        index
    }

    #[test]
    fn test_reserve_and_find() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let border = make_border(&pools);
        let index = reserve(border, b"hello", 8);
        assert_eq!(index, 0);
        let count = border.common().version().stable().key_count();
        assert_eq!(count, 1);

        let slice = slice_layer(b"hello", 0);
        assert_eq!(border.find_key(count, slice, b"", 5), Some(0));
        // Same slice, different length: no match.
        assert_eq!(border.find_key(count, slice, b"", 4), None);
        assert!(border.owner_id(0).load().is_deleted());
        assert_eq!(border.payload_length(0), 8);
    }

    #[test]
    fn test_find_with_suffix() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let border = make_border(&pools);
        let key = b"0123456789AB"; // 12 bytes: 8-byte slice + 4-byte suffix
        reserve(border, key, 16);
        let count = border.common().version().stable().key_count();
        let slice = slice_layer(key, 0);
        assert_eq!(border.find_key(count, slice, b"89AB", 12), Some(0));
        assert_eq!(border.find_key(count, slice, b"89AC", 12), None);
        assert_eq!(border.suffix(0), b"89AB");
    }

    #[test]
    fn test_find_key_for_reserve_classification() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let border = make_border(&pools);
        let key = b"0123456789AB";
        reserve(border, key, 8);
        let count = border.common().version().stable().key_count();
        let slice = slice_layer(key, 0);

        assert_eq!(
            border.find_key_for_reserve(0, count, slice, b"89AB", 12),
            FindKeyForReserve::ExactMatchLocalRecord(0)
        );
        // Same slice, different suffix: conflicting.
        assert_eq!(
            border.find_key_for_reserve(0, count, slice, b"ZZZZ", 12),
            FindKeyForReserve::ConflictingLocalRecord(0)
        );
        // Slice-only key with the same slice does not conflict.
        assert_eq!(
            border.find_key_for_reserve(0, count, slice, b"", 8),
            FindKeyForReserve::NotFound
        );
        let other = slice_layer(b"zzzzzzzz", 0);
        assert_eq!(
            border.find_key_for_reserve(0, count, other, b"", 8),
            FindKeyForReserve::NotFound
        );
    }

    #[test]
    fn test_capacity_by_slot_count() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let border = make_border(&pools);
        for i in 0..BORDER_MAX_KEYS {
            let key = (i as u64).to_be_bytes();
            assert!(border.can_accommodate(i, 8, 8));
            reserve(border, &key, 8);
        }
        assert!(!border.can_accommodate(BORDER_MAX_KEYS, 8, 8));
    }

    #[test]
    fn test_capacity_by_data_area() {
        // 32 slots of (suffix 0, payload 128) = 4096 bytes > data area.
        assert!(BorderPage::fits_in_empty(8, 128));
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let border = make_border(&pools);
        let mut reserved = 0usize;
        while border.can_accommodate(reserved, 8, 128) {
            let key = (reserved as u64).to_be_bytes();
            reserve(border, &key, 128);
            reserved += 1;
        }
        assert!(reserved < BORDER_MAX_KEYS);
        assert!(reserved >= BORDER_DATA_SIZE / 256);
    }

    #[test]
    fn test_payload_zeroed_on_reserve() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let border = make_border(&pools);
        reserve(border, b"key", 16);
        let payload = border.record_payload(0);
        let bytes = unsafe { std::slice::from_raw_parts(payload, 16) };
        assert_eq!(bytes, &[0u8; 16]);
    }

    #[test]
    fn test_reuse_moved_slot() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let border = make_border(&pools);
        reserve(border, b"migrated", 8);
        reserve(border, b"stays", 8);
        // Slot 0's record migrated to a foster child in some split.
        let moved = border.owner_id(0).load().with_moved();
        border.owner_id(0).publish(moved);
        assert_eq!(border.find_reusable_slot(2), Some(0));

        let key = b"newcomer";
        let slice = slice_layer(key, 0);
        {
            let mut guard = border.common().version().lock();
            let owner = XctId::new_clean(Epoch::INITIAL, 0, 0).with_deleted();
            border.reuse_moved_slot(&mut guard, 0, owner, slice, b"", 8, 8);
        }
        let count = border.common().version().stable().key_count();
        assert_eq!(count, 2);
        assert_eq!(border.find_key(count, slice, b"", 8), Some(0));
        assert!(!border.owner_id(0).load().is_moved());
        assert!(border.owner_id(0).load().is_deleted());
        assert_eq!(border.find_reusable_slot(count), None);
        // The surviving slot is untouched.
        assert_eq!(
            border.find_key(count, slice_layer(b"stays", 0), b"", 5),
            Some(1)
        );
    }

    #[test]
    fn test_next_layer_conversion() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let border = make_border(&pools);
        let key = b"0123456789AB";
        reserve(border, key, 8);
        assert!(!border.does_point_to_layer(0));

        let pointer = VolatilePointer::new(0, 0, 0, 77);
        border.set_next_layer(0, pointer);
        assert!(border.does_point_to_layer(0));
        assert_eq!(border.next_layer_pointer(0).volatile_pointer(), pointer);

        // A layer-pointer slot now answers layer queries.
        let count = border.common().version().stable().key_count();
        let slice = slice_layer(key, 0);
        assert_eq!(
            border.find_key_for_reserve(0, count, slice, b"89AB", 12),
            FindKeyForReserve::ExactMatchLayerPointer(0)
        );
        // But not for a slice-only key.
        assert_eq!(
            border.find_key_for_reserve(0, count, slice, b"", 8),
            FindKeyForReserve::NotFound
        );
    }
}
