//! Record owner-id words.
//!
//! Every record carries a 64-bit [`XctId`] combining the committing
//! transaction's epoch and in-epoch ordinal with status bits (lock,
//! deleted, moved). The word is stored in an [`OwnerId`] atomic cell
//! inside the page; the cell's address is the identity of read-set and
//! write-set entries.
//!
//! # Invariants
//! - The lock bit is held by at most one writer at a time.
//! - Commits on the same record are monotone: a later commit has a
//!   strictly greater (epoch, ordinal) pair.
//! - A reader observing a locked word must retry or spin; a reader
//!   observing the moved bit must re-navigate from the tree root.

use std::fmt;
use std::sync::atomic::AtomicU64;

use crate::epoch::Epoch;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::version::backoff;

/// Record lock bit.
const LOCK_BIT: u64 = 1 << 63;

/// The record is logically absent.
const DELETED_BIT: u64 = 1 << 62;

/// The record migrated to a foster child; readers must re-navigate and
/// write-set locks observing it must abort.
const MOVED_BIT: u64 = 1 << 61;

const STATUS_MASK: u64 = LOCK_BIT | DELETED_BIT | MOVED_BIT;

const EPOCH_SHIFT: u32 = 32;
const EPOCH_MASK: u64 = 0x0FFF_FFFF;

const ORDINAL_SHIFT: u32 = 16;
const ORDINAL_MASK: u64 = 0xFFFF;

const THREAD_MASK: u64 = 0xFFFF;

/// Largest in-epoch ordinal; the next commit wraps into the next epoch.
pub const MAX_ORDINAL: u16 = u16::MAX;

// ============================================================================
//  XctId
// ============================================================================

/// An owner-id word by value.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct XctId(u64);

impl XctId {
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

    /// A clean (unlocked, live) id for a committing transaction.
    #[inline]
    #[must_use]
    pub fn new_clean(epoch: Epoch, ordinal: u16, thread_id: u16) -> Self {
        Self(
            ((u64::from(epoch.raw()) & EPOCH_MASK) << EPOCH_SHIFT)
                | (u64::from(ordinal) << ORDINAL_SHIFT)
                | u64::from(thread_id),
        )
    }

    #[inline]
    #[must_use]
    pub const fn is_locked(self) -> bool {
        (self.0 & LOCK_BIT) != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_deleted(self) -> bool {
        (self.0 & DELETED_BIT) != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_moved(self) -> bool {
        (self.0 & MOVED_BIT) != 0
    }

    #[inline]
    #[must_use]
    pub fn epoch(self) -> Epoch {
        Epoch::from_raw(((self.0 >> EPOCH_SHIFT) & EPOCH_MASK) as u32)
    }

    #[inline]
    #[must_use]
    pub const fn ordinal(self) -> u16 {
        ((self.0 >> ORDINAL_SHIFT) & ORDINAL_MASK) as u16
    }

    #[inline]
    #[must_use]
    pub const fn thread_id(self) -> u16 {
        (self.0 & THREAD_MASK) as u16
    }

    #[inline]
    #[must_use]
    pub const fn with_deleted(self) -> Self {
        Self(self.0 | DELETED_BIT)
    }

    #[inline]
    #[must_use]
    pub const fn without_deleted(self) -> Self {
        Self(self.0 & !DELETED_BIT)
    }

    #[inline]
    #[must_use]
    pub const fn with_moved(self) -> Self {
        Self(self.0 | MOVED_BIT)
    }

    #[inline]
    #[must_use]
    pub const fn without_lock(self) -> Self {
        Self(self.0 & !LOCK_BIT)
    }

    /// Replace epoch and ordinal, keeping status bits and thread id.
    #[inline]
    #[must_use]
    pub fn with_epoch_ordinal(self, epoch: Epoch, ordinal: u16) -> Self {
        let status = self.0 & (STATUS_MASK | THREAD_MASK);
        Self(
            status
                | ((u64::from(epoch.raw()) & EPOCH_MASK) << EPOCH_SHIFT)
                | (u64::from(ordinal) << ORDINAL_SHIFT),
        )
    }

    /// Equality ignoring the lock bit, as used by read-set validation.
    #[inline]
    #[must_use]
    pub const fn equals_ignoring_lock(self, other: Self) -> bool {
        (self.0 & !LOCK_BIT) == (other.0 & !LOCK_BIT)
    }

    /// Lexicographic (epoch, ordinal) comparison for monotonicity checks.
    #[inline]
    #[must_use]
    pub fn commit_order(self) -> (Epoch, u16) {
        (self.epoch(), self.ordinal())
    }
}

impl fmt::Debug for XctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "XctId({}, ord={}, thread={}{}{}{})",
            self.epoch(),
            self.ordinal(),
            self.thread_id(),
            if self.is_locked() { ", locked" } else { "" },
            if self.is_deleted() { ", deleted" } else { "" },
            if self.is_moved() { ", moved" } else { "" },
        )
    }
}

// ============================================================================
//  OwnerId
// ============================================================================

/// The atomic owner-id cell embedded in pages, one per record.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct OwnerId {
    word: AtomicU64,
}

impl OwnerId {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> XctId {
        XctId(self.word.load(READ_ORD))
    }

    /// Store without lock semantics; used only while the page lock or the
    /// record lock makes this cell private to the caller.
    #[inline]
    pub fn store_relaxed(&self, id: XctId) {
        self.word.store(id.0, RELAXED);
    }

    /// Publish a new id, releasing the record lock if `id` has it clear.
    #[inline]
    pub fn publish(&self, id: XctId) {
        self.word.store(id.0, WRITE_ORD);
    }

    /// Spin until the record lock is acquired; returns the id as observed
    /// at the moment of acquisition (with the lock bit set).
    pub fn lock_unconditional(&self) -> XctId {
        let mut spins: u32 = 0;
        loop {
            let word = self.word.load(RELAXED);
            if (word & LOCK_BIT) != 0 {
                backoff(&mut spins);
                continue;
            }
            if self
                .word
                .compare_exchange_weak(word, word | LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                return XctId(word | LOCK_BIT);
            }
            backoff(&mut spins);
        }
    }

    /// Release the record lock, keeping everything else unchanged.
    #[inline]
    pub fn release_lock(&self) {
        let word = self.word.load(RELAXED);
        debug_assert!((word & LOCK_BIT) != 0, "releasing an unlocked record");
        self.word.store(word & !LOCK_BIT, WRITE_ORD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_id_fields() {
        let id = XctId::new_clean(Epoch::from_raw(7), 3, 11);
        assert_eq!(id.epoch(), Epoch::from_raw(7));
        assert_eq!(id.ordinal(), 3);
        assert_eq!(id.thread_id(), 11);
        assert!(!id.is_locked());
        assert!(!id.is_deleted());
        assert!(!id.is_moved());
    }

    #[test]
    fn test_status_bits() {
        let id = XctId::new_clean(Epoch::INITIAL, 1, 0);
        let deleted = id.with_deleted();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.without_deleted(), id);
        assert!(id.with_moved().is_moved());
    }

    #[test]
    fn test_equals_ignoring_lock() {
        let id = XctId::new_clean(Epoch::from_raw(5), 9, 2);
        let locked = XctId(id.word() | LOCK_BIT);
        assert!(id.equals_ignoring_lock(locked));
        assert!(!id.equals_ignoring_lock(id.with_deleted()));
    }

    #[test]
    fn test_commit_order_monotone() {
        let a = XctId::new_clean(Epoch::from_raw(3), 9, 0);
        let b = XctId::new_clean(Epoch::from_raw(3), 10, 0);
        let c = XctId::new_clean(Epoch::from_raw(4), 0, 0);
        assert!(a.commit_order() < b.commit_order());
        assert!(b.commit_order() < c.commit_order());
    }

    #[test]
    fn test_with_epoch_ordinal_keeps_status() {
        let id = XctId::new_clean(Epoch::from_raw(2), 5, 7).with_deleted();
        let bumped = id.with_epoch_ordinal(Epoch::from_raw(3), 0);
        assert_eq!(bumped.epoch(), Epoch::from_raw(3));
        assert_eq!(bumped.ordinal(), 0);
        assert_eq!(bumped.thread_id(), 7);
        assert!(bumped.is_deleted());
    }

    #[test]
    fn test_owner_lock_cycle() {
        let owner = OwnerId::new();
        owner.store_relaxed(XctId::new_clean(Epoch::INITIAL, 1, 4));
        let observed = owner.lock_unconditional();
        assert!(observed.is_locked());
        assert!(owner.load().is_locked());
        owner.release_lock();
        assert!(!owner.load().is_locked());
        assert_eq!(owner.load().ordinal(), 1);
    }

    #[test]
    fn test_owner_lock_contention() {
        use std::sync::Arc;
        let owner = Arc::new(OwnerId::new());
        let mut handles = Vec::new();
        for thread in 0..4u16 {
            let owner = Arc::clone(&owner);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let observed = owner.lock_unconditional();
                    let next = observed
                        .without_lock()
                        .with_epoch_ordinal(observed.epoch(), observed.ordinal().wrapping_add(1));
                    let _ = thread;
                    owner.publish(next);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // 2000 wrapping increments on top of the initial ordinal 1.
        assert_eq!(owner.load().ordinal(), 2001);
        assert!(!owner.load().is_locked());
    }
}
