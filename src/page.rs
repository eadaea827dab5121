//! Page header and page pointers.
//!
//! Every page is a 4 KiB aligned block beginning with a [`PageHeader`]:
//! page id, storage id, page type, in-layer level, and the version word.
//! A page's type and storage never change after initialization; the
//! version word is the page's sole synchronization point.
//!
//! Pages reference each other only through [`VolatilePointer`] offsets
//! resolved by the page pools, never through owned pointers. This keeps
//! parent/foster cycles out of the ownership graph by construction.

use std::sync::atomic::AtomicU64;

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::version::PageVersion;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Identifier of a storage, dense and starting at 1.
pub type StorageId = u32;

/// Identifier of a snapshot page (opaque to the core; 0 = none).
pub type SnapshotPageId = u64;

// ============================================================================
//  PageType
// ============================================================================

/// Discriminates the body layout of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Unknown = 0,
    Array = 1,
    MasstreeBorder = 2,
    MasstreeIntermediate = 3,
}

impl PageType {
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Array,
            2 => Self::MasstreeBorder,
            3 => Self::MasstreeIntermediate,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
//  VolatilePointer
// ============================================================================

/// Flag on a volatile pointer: the pointee is a root page that may be
/// swapped by root growth. Traversals must record such pointers in the
/// transaction's pointer set.
pub const VOLATILE_FLAG_SWAPPABLE: u8 = 0x01;

/// A compact reference to a page slot in some node's volatile pool.
///
/// Packs node (8 bits), flags (8 bits), mod-count (16 bits), and pool
/// offset (32 bits) in a `u64`. Offset zero denotes "no page"; the mod
/// count detects stale pointer captures across swaps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolatilePointer(u64);

impl VolatilePointer {
    /// The null pointer.
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(node: u8, flags: u8, mod_count: u16, offset: u32) -> Self {
        Self(
            ((node as u64) << 56)
                | ((flags as u64) << 48)
                | ((mod_count as u64) << 32)
                | offset as u64,
        )
    }

    #[inline]
    #[must_use]
    pub const fn from_word(word: u64) -> Self {
        Self(word)
    }

    #[inline]
    #[must_use]
    pub const fn word(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn node(self) -> u8 {
        (self.0 >> 56) as u8
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> u8 {
        (self.0 >> 48) as u8
    }

    #[inline]
    #[must_use]
    pub const fn mod_count(self) -> u16 {
        (self.0 >> 32) as u16
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.offset() == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_swappable(self) -> bool {
        (self.flags() & VOLATILE_FLAG_SWAPPABLE) != 0
    }

    /// The same pointer with flags and mod-count cleared, as stored into
    /// interior structures that never swap the pointee.
    #[inline]
    #[must_use]
    pub const fn without_flags(self) -> Self {
        Self::new(self.node(), 0, 0, self.offset())
    }
}

// ============================================================================
//  DualPointer
// ============================================================================

/// A pair of snapshot page id and volatile page pointer.
///
/// Either may be null; at least one is non-null for reachable pages. The
/// core never faults in snapshot pages (that is the snapshot subsystem's
/// job), so a null volatile side surfaces as `NotImplemented` at the
/// call sites that could encounter one.
#[derive(Debug, Default)]
#[repr(C)]
pub struct DualPointer {
    snapshot: AtomicU64,
    volatile: AtomicU64,
}

impl DualPointer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            snapshot: AtomicU64::new(0),
            volatile: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn snapshot_id(&self) -> SnapshotPageId {
        self.snapshot.load(READ_ORD)
    }

    #[inline]
    #[must_use]
    pub fn volatile_pointer(&self) -> VolatilePointer {
        VolatilePointer::from_word(self.volatile.load(READ_ORD))
    }

    #[inline]
    pub fn set_snapshot_id(&self, id: SnapshotPageId) {
        self.snapshot.store(id, WRITE_ORD);
    }

    /// Publish a volatile pointer. Release: the pointee must be fully
    /// initialized before this store.
    #[inline]
    pub fn set_volatile(&self, pointer: VolatilePointer) {
        self.volatile.store(pointer.word(), WRITE_ORD);
    }

    /// Store without publication semantics, for single-writer init paths.
    #[inline]
    pub fn set_volatile_relaxed(&self, pointer: VolatilePointer) {
        self.volatile.store(pointer.word(), RELAXED);
    }

    /// Swap the volatile pointer if it still equals `expected`.
    pub fn cas_volatile(&self, expected: VolatilePointer, new: VolatilePointer) -> bool {
        self.volatile
            .compare_exchange(
                expected.word(),
                new.word(),
                crate::ordering::CAS_SUCCESS,
                crate::ordering::CAS_FAILURE,
            )
            .is_ok()
    }

    /// The raw atomic cell of the volatile side, used as the identity of
    /// a pointer-set entry.
    #[inline]
    #[must_use]
    pub fn volatile_cell(&self) -> &AtomicU64 {
        &self.volatile
    }

    #[inline]
    #[must_use]
    pub fn is_both_null(&self) -> bool {
        self.snapshot_id() == 0 && self.volatile_pointer().is_null()
    }

    /// Copy both words from `other`.
    pub fn copy_from(&self, other: &Self) {
        self.snapshot.store(other.snapshot_id(), RELAXED);
        self.volatile.store(other.volatile_pointer().word(), WRITE_ORD);
    }

    pub fn clear(&self) {
        self.snapshot.store(0, RELAXED);
        self.volatile.store(0, WRITE_ORD);
    }
}

// ============================================================================
//  PageHeader
// ============================================================================

/// Common header at the start of every page.
#[derive(Debug)]
#[repr(C)]
pub struct PageHeader {
    /// This page's own volatile pointer word (node + offset encoding).
    pub page_id: u64,

    /// Owning storage. Never changes after initialization.
    pub storage_id: StorageId,

    /// Page type discriminant. Never changes after initialization.
    pub page_type: u8,

    /// Masstree layer, or array level, of this page.
    pub level: u8,

    reserved: u16,

    /// The page's sole synchronization point.
    pub version: PageVersion,
}

impl PageHeader {
    /// Initialize header fields in place. Only valid before the page is
    /// reachable by other threads.
    pub fn initialize(
        &mut self,
        storage_id: StorageId,
        page_id: VolatilePointer,
        page_type: PageType,
        level: u8,
    ) {
        self.page_id = page_id.word();
        self.storage_id = storage_id;
        self.page_type = page_type as u8;
        self.level = level;
        self.reserved = 0;
    }

    #[inline]
    #[must_use]
    pub fn page_type(&self) -> PageType {
        PageType::from_raw(self.page_type)
    }

    #[inline]
    #[must_use]
    pub fn self_pointer(&self) -> VolatilePointer {
        VolatilePointer::from_word(self.page_id)
    }
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == 24);
const _: () = assert!(std::mem::size_of::<DualPointer>() == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_pointer_packing() {
        let p = VolatilePointer::new(3, VOLATILE_FLAG_SWAPPABLE, 7, 42);
        assert_eq!(p.node(), 3);
        assert!(p.is_swappable());
        assert_eq!(p.mod_count(), 7);
        assert_eq!(p.offset(), 42);
        assert!(!p.is_null());
        assert_eq!(VolatilePointer::from_word(p.word()), p);
    }

    #[test]
    fn test_null_pointer() {
        assert!(VolatilePointer::NULL.is_null());
        // Offset zero is null regardless of node.
        assert!(VolatilePointer::new(2, 0, 5, 0).is_null());
    }

    #[test]
    fn test_without_flags() {
        let p = VolatilePointer::new(1, VOLATILE_FLAG_SWAPPABLE, 9, 10);
        let clean = p.without_flags();
        assert_eq!(clean.node(), 1);
        assert_eq!(clean.offset(), 10);
        assert_eq!(clean.flags(), 0);
        assert_eq!(clean.mod_count(), 0);
    }

    #[test]
    fn test_dual_pointer_cas() {
        let dual = DualPointer::new();
        assert!(dual.is_both_null());
        let a = VolatilePointer::new(0, 0, 0, 5);
        let b = VolatilePointer::new(0, 0, 1, 6);
        dual.set_volatile(a);
        assert!(!dual.cas_volatile(b, a));
        assert!(dual.cas_volatile(a, b));
        assert_eq!(dual.volatile_pointer(), b);
    }

    #[test]
    fn test_page_type_round_trip() {
        for t in [
            PageType::Array,
            PageType::MasstreeBorder,
            PageType::MasstreeIntermediate,
        ] {
            assert_eq!(PageType::from_raw(t as u8), t);
        }
        assert_eq!(PageType::from_raw(200), PageType::Unknown);
    }
}
