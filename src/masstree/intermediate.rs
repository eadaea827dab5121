//! Masstree intermediate (routing) pages.
//!
//! An intermediate page routes through a two-level fanout: an outer
//! selector of up to [`MINIPAGES`] minipages, each holding up to
//! [`MINI_POINTERS`] child pointers separated by ascending key slices.
//! Each minipage carries its own version word with its own lock and key
//! count, so adoptions on different minipages proceed concurrently.
//!
//! # Invariants
//! - Separators within a minipage are strictly ascending.
//! - Minipage boundaries (the outer separators) are strictly ascending.
//! - Each child's fence range is a subrange of this page's.

use crate::key::KeySlice;
use crate::ordering::{READ_ORD, RELAXED};
use crate::page::{DualPointer, PageType, StorageId, VolatilePointer, PAGE_SIZE};
use crate::version::{PageVersion, VersionGuard};

use super::MasstreePage;
use std::sync::atomic::AtomicU64;

/// Minipages per intermediate page (outer separators = MINIPAGES - 1).
pub const MINIPAGES: usize = 10;

/// Separators per minipage.
pub const MINI_SEPARATORS: usize = 15;

/// Child pointers per minipage.
pub const MINI_POINTERS: usize = MINI_SEPARATORS + 1;

/// Pointers per minipage after a repack, leaving insertion room.
pub(crate) const REPACK_POINTERS: usize = MINI_POINTERS / 2;

// ============================================================================
//  MiniPage
// ============================================================================

/// One minipage: separators, pointers, and its own version word.
#[repr(C)]
pub struct MiniPage {
    version: PageVersion,
    separators: [AtomicU64; MINI_SEPARATORS],
    pointers: [DualPointer; MINI_POINTERS],
}

const _: () = assert!(std::mem::size_of::<MiniPage>() == 384);

impl MiniPage {
    #[inline]
    pub(crate) fn version(&self) -> &PageVersion {
        &self.version
    }

    #[inline]
    pub(crate) fn separator(&self, index: usize) -> KeySlice {
        self.separators[index].load(READ_ORD)
    }

    #[inline]
    pub(crate) fn pointer(&self, index: usize) -> &DualPointer {
        &self.pointers[index]
    }

    /// Upper-bound search: the pointer index for `slice` among
    /// `key_count + 1` children.
    pub(crate) fn find_pointer(&self, key_count: usize, slice: KeySlice) -> usize {
        debug_assert!(key_count <= MINI_SEPARATORS);
        for index in 0..key_count {
            if slice < self.separator(index) {
                return index;
            }
        }
        key_count
    }

    /// Insert `(separator, pointer)` after child `position`, shifting the
    /// tail right. The caller holds this minipage's lock.
    pub(crate) fn insert_separator(
        &self,
        guard: &mut VersionGuard<'_>,
        position: usize,
        separator: KeySlice,
        pointer: VolatilePointer,
    ) {
        debug_assert!(guard.locks(&self.version));
        let count = guard.snapshot().key_count();
        debug_assert!(count < MINI_SEPARATORS);
        debug_assert!(position <= count);
        // Mark before mutating so concurrent readers retry.
        guard.mark_inserting();
        for index in (position..count).rev() {
            let separator = self.separators[index].load(RELAXED);
            self.separators[index + 1].store(separator, RELAXED);
        }
        for index in (position + 1..=count).rev() {
            self.pointers[index + 1].copy_from(&self.pointers[index]);
        }
        self.separators[position].store(separator, RELAXED);
        self.pointers[position + 1].set_snapshot_id(0);
        self.pointers[position + 1].set_volatile(pointer);
        guard.set_key_count(count + 1);
    }

    /// Overwrite the whole minipage. Only for unpublished pages or under
    /// the page lock with this minipage's readers fenced off by the
    /// page's splitting bit.
    pub(crate) fn rebuild(&self, pointers: &[VolatilePointer], separators: &[KeySlice]) {
        debug_assert!(!pointers.is_empty());
        debug_assert_eq!(separators.len(), pointers.len() - 1);
        debug_assert!(pointers.len() <= MINI_POINTERS);
        for (index, pointer) in pointers.iter().enumerate() {
            self.pointers[index].set_snapshot_id(0);
            self.pointers[index].set_volatile(*pointer);
        }
        for (index, separator) in separators.iter().enumerate() {
            self.separators[index].store(*separator, RELAXED);
        }
        self.version.reset_with_key_count(separators.len());
    }
}

// ============================================================================
//  IntermediatePage
// ============================================================================

/// A masstree intermediate page.
#[repr(C)]
pub struct IntermediatePage {
    common: MasstreePage,
    separators: [AtomicU64; MINIPAGES - 1],
    minipages: [MiniPage; MINIPAGES],
}

const _: () = assert!(std::mem::size_of::<IntermediatePage>() <= PAGE_SIZE);

impl IntermediatePage {
    /// Initialize an intermediate page in place with zero minipages in
    /// use (outer key count 0, minipage 0 empty).
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
                PageType::MasstreeIntermediate,
                layer,
                false,
                root,
                low_fence,
                high_fence,
                high_fence_supremum,
            );
            for mini in &this.minipages {
                mini.version.reset_with_key_count(0);
                for pointer in &mini.pointers {
                    pointer.clear();
                }
            }
        }
    }

    #[inline]
    pub(crate) fn common(&self) -> &MasstreePage {
        &self.common
    }

    #[inline]
    pub(crate) fn minipage(&self, index: usize) -> &MiniPage {
        &self.minipages[index]
    }

    #[inline]
    pub(crate) fn outer_separator(&self, index: usize) -> KeySlice {
        self.separators[index].load(READ_ORD)
    }

    /// Upper-bound search over the outer separators: the minipage index
    /// for `slice` given the page's stable key count.
    pub(crate) fn find_minipage(&self, key_count: usize, slice: KeySlice) -> usize {
        debug_assert!(key_count < MINIPAGES);
        for index in 0..key_count {
            if slice < self.outer_separator(index) {
                return index;
            }
        }
        key_count
    }

    /// Repack `pointers`/`separators` into minipages of
    /// [`REPACK_POINTERS`] entries each, returning the outer key count.
    ///
    /// Only for unpublished pages or under the page lock with readers
    /// fenced off by the splitting bit.
    pub(crate) fn repack(
        &self,
        pointers: &[VolatilePointer],
        separators: &[KeySlice],
    ) -> usize {
        debug_assert!(!pointers.is_empty());
        debug_assert_eq!(separators.len(), pointers.len() - 1);
        let minis_needed = pointers.len().div_ceil(REPACK_POINTERS);
        debug_assert!(minis_needed <= MINIPAGES);
        let mut start = 0usize;
        for mini_index in 0..minis_needed {
            let end = (start + REPACK_POINTERS).min(pointers.len());
            self.minipages[mini_index]
                .rebuild(&pointers[start..end], &separators[start..end - 1]);
            if mini_index + 1 < minis_needed {
                self.separators[mini_index].store(separators[end - 1], RELAXED);
            }
            start = end;
        }
        minis_needed - 1
    }

    /// Flatten the live (separator, pointer) entries in order.
    ///
    /// The caller holds the page lock and every in-use minipage's lock,
    /// so the counts and contents are frozen.
    pub(crate) fn flatten(
        &self,
        outer_count: usize,
        mini_counts: &[usize],
    ) -> (Vec<VolatilePointer>, Vec<KeySlice>) {
        let mut pointers = Vec::new();
        let mut separators = Vec::new();
        for mini_index in 0..=outer_count {
            let mini = &self.minipages[mini_index];
            let count = mini_counts[mini_index];
            for pointer_index in 0..=count {
                pointers.push(mini.pointer(pointer_index).volatile_pointer());
            }
            for separator_index in 0..count {
                separators.push(mini.separator(separator_index));
            }
            if mini_index < outer_count {
                separators.push(self.outer_separator(mini_index));
            }
        }
        debug_assert_eq!(separators.len() + 1, pointers.len());
        (pointers, separators)
    }
}
