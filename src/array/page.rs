//! Array page layout.
//!
//! Leaf pages hold records sequentially indexed by array offset; each
//! record is an owner-id word followed by the 8-byte-aligned payload.
//! Interior pages hold a fixed fanout of dual pointers. Both carry the
//! half-open offset range they cover.

use std::cell::UnsafeCell;

use crate::epoch::Epoch;
use crate::page::{DualPointer, PageHeader, PageType, StorageId, VolatilePointer, PAGE_SIZE};
use crate::xct::id::{OwnerId, XctId};

/// Byte size of the fixed fields before the data area.
const ARRAY_PAGE_FIXED: usize = 48;

/// Byte size of the data area.
pub const ARRAY_DATA_SIZE: usize = PAGE_SIZE - ARRAY_PAGE_FIXED;

/// Dual pointers per interior page.
pub const INTERIOR_FANOUT: usize = ARRAY_DATA_SIZE / std::mem::size_of::<DualPointer>();

/// Per-record overhead: the owner-id word.
pub const RECORD_OVERHEAD: usize = 8;

#[inline]
pub(crate) const fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Bytes one leaf record occupies.
#[inline]
#[must_use]
pub const fn record_stride(payload_size: u16) -> usize {
    RECORD_OVERHEAD + align8(payload_size as usize)
}

/// Records per leaf page for a payload size.
#[inline]
#[must_use]
pub const fn records_per_leaf(payload_size: u16) -> u64 {
    (ARRAY_DATA_SIZE / record_stride(payload_size)) as u64
}

// ============================================================================
//  ArrayPage
// ============================================================================

/// A page of the fixed-depth array index.
#[repr(C)]
pub struct ArrayPage {
    header: PageHeader,
    payload_size: u16,
    leaf: u8,
    _pad: [u8; 5],
    range_begin: u64,
    range_end: u64,
    data: UnsafeCell<[u8; ARRAY_DATA_SIZE]>,
}

const _: () = assert!(std::mem::size_of::<ArrayPage>() == PAGE_SIZE);

impl ArrayPage {
    /// Initialize a page in place.
    ///
    /// # Safety
    /// `page` must point at an exclusive, unpublished page slot.
    pub unsafe fn initialize(
        page: *mut Self,
        initial_epoch: Epoch,
        storage_id: StorageId,
        page_id: VolatilePointer,
        payload_size: u16,
        level: u8,
        range: (u64, u64),
    ) {
        // SAFETY: exclusive access per the contract.
        unsafe {
            let this = &mut *page;
            this.header
                .initialize(storage_id, page_id, PageType::Array, level);
            this.header.version.initialize(level == 0, false, false);
            this.payload_size = payload_size;
            this.leaf = u8::from(level == 0);
            this._pad = [0; 5];
            this.range_begin = range.0;
            this.range_end = range.1;
            std::ptr::write_bytes((*this.data.get()).as_mut_ptr(), 0, ARRAY_DATA_SIZE);
            if level == 0 {
                // Array records always exist; they are born live at the
                // creation epoch.
                let initial = XctId::new_clean(initial_epoch, 0, 0);
                let count = this.record_count();
                for index in 0..count {
                    this.leaf_owner(index).store_relaxed(initial);
                }
            }
        }
    }

    #[inline]
    #[must_use]
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.leaf != 0
    }

    #[inline]
    #[must_use]
    pub fn range(&self) -> (u64, u64) {
        (self.range_begin, self.range_end)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.range_begin && offset < self.range_end
    }

    /// Records this leaf page covers.
    #[inline]
    #[must_use]
    pub fn record_count(&self) -> u16 {
        debug_assert!(self.is_leaf());
        (self.range_end - self.range_begin) as u16
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        self.data.get().cast::<u8>()
    }

    /// The dual pointer at an interior index.
    #[inline]
    #[must_use]
    pub fn interior_record(&self, index: usize) -> &DualPointer {
        debug_assert!(!self.is_leaf());
        debug_assert!(index < INTERIOR_FANOUT);
        // SAFETY: the data area of an interior page is an array of
        // DualPointer cells; index is in bounds.
        unsafe {
            &*self
                .data_ptr()
                .add(index * std::mem::size_of::<DualPointer>())
                .cast::<DualPointer>()
        }
    }

    /// The owner-id cell of a leaf record.
    #[inline]
    #[must_use]
    pub fn leaf_owner(&self, index: u16) -> &OwnerId {
        debug_assert!(self.is_leaf());
        debug_assert!(index < self.record_count());
        let stride = record_stride(self.payload_size);
        // SAFETY: the record area holds `record_count` stride-sized
        // records starting with an OwnerId word; index is in bounds.
        unsafe { &*self.data_ptr().add(index as usize * stride).cast::<OwnerId>() }
    }

    /// The payload bytes of a leaf record.
    #[inline]
    #[must_use]
    pub fn leaf_payload(&self, index: u16) -> *mut u8 {
        debug_assert!(self.is_leaf());
        let stride = record_stride(self.payload_size);
        // SAFETY: as in `leaf_owner`, payload follows the owner word.
        unsafe {
            self.data_ptr()
                .add(index as usize * stride + RECORD_OVERHEAD)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PagePools;

    fn init_leaf(pools: &PagePools, payload_size: u16, range: (u64, u64)) -> *mut ArrayPage {
        let pointer = pools.grab_on(0).unwrap();
        let page = pools.resolve(pointer).cast::<ArrayPage>();
        unsafe {
            ArrayPage::initialize(page, Epoch::INITIAL, 1, pointer, payload_size, 0, range);
        }
        page
    }

    #[test]
    fn test_fanout_constants() {
        assert_eq!(INTERIOR_FANOUT, 253);
        assert_eq!(record_stride(8), 16);
        assert_eq!(records_per_leaf(8), 253);
        // Payloads are aligned up to 8 bytes.
        assert_eq!(record_stride(5), 16);
        assert_eq!(records_per_leaf(1024), 3);
    }

    #[test]
    fn test_leaf_initialization() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let page = init_leaf(&pools, 8, (0, 16));
        let page = unsafe { &*page };
        assert!(page.is_leaf());
        assert!(page.contains(0));
        assert!(page.contains(15));
        assert!(!page.contains(16));
        assert_eq!(page.record_count(), 16);
        for index in 0..16 {
            let id = page.leaf_owner(index).load();
            assert_eq!(id.epoch(), Epoch::INITIAL);
            assert!(!id.is_deleted());
            assert!(!id.is_locked());
        }
    }

    #[test]
    fn test_payload_addresses_disjoint() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let page = init_leaf(&pools, 8, (0, 4));
        let page = unsafe { &*page };
        let a = page.leaf_payload(0) as usize;
        let b = page.leaf_payload(1) as usize;
        assert_eq!(b - a, record_stride(8));
    }

    #[test]
    fn test_interior_records_zeroed() {
        let pools = PagePools::new(1, 64 * PAGE_SIZE).unwrap();
        let pointer = pools.grab_on(0).unwrap();
        let page = pools.resolve(pointer).cast::<ArrayPage>();
        unsafe {
            ArrayPage::initialize(page, Epoch::INITIAL, 1, pointer, 8, 1, (0, 1000));
        }
        let page = unsafe { &*page };
        assert!(!page.is_leaf());
        for index in [0usize, 1, INTERIOR_FANOUT - 1] {
            assert!(page.interior_record(index).is_both_null());
        }
    }
}
