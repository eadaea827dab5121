//! Coarse logical time.
//!
//! An [`Epoch`] is a coarse time quantum: all transactions committing
//! within an epoch are serializable with any ordering that respects their
//! in-epoch ordinals. The engine holds one [`GlobalEpoch`]; workers read
//! it at transaction begin and at precommit.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Number of bits an epoch occupies inside an owner-id word.
pub const EPOCH_BITS: u32 = 28;

/// Largest representable epoch value.
pub const MAX_EPOCH: u32 = (1 << EPOCH_BITS) - 1;

/// A coarse time quantum. Zero is the invalid sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u32);

impl Epoch {
    /// The first valid epoch of a freshly initialized engine.
    pub const INITIAL: Self = Self(1);

    /// Construct from a raw value. Zero yields the invalid epoch.
    #[inline]
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value & MAX_EPOCH)
    }

    /// Raw value for packing into an owner-id word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this epoch is valid (non-zero).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The epoch immediately after this one.
    ///
    /// Skips the invalid zero value on wrap-around.
    #[inline]
    #[must_use]
    pub const fn one_more(self) -> Self {
        let next = (self.0 + 1) & MAX_EPOCH;
        if next == 0 { Self(1) } else { Self(next) }
    }

    /// The later of two epochs.
    #[inline]
    #[must_use]
    pub fn max_of(self, other: Self) -> Self {
        if other > self { other } else { self }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch-{}", self.0)
    }
}

// ============================================================================
//  GlobalEpoch
// ============================================================================

/// The engine-wide current epoch.
///
/// Epoch advancement is normally driven by the host's commit-wait calls;
/// there is no dedicated ticker thread in the core. Log-durability
/// tracking per epoch belongs to the external logger.
#[derive(Debug)]
pub struct GlobalEpoch {
    current: AtomicU32,
}

impl GlobalEpoch {
    /// Create a global epoch starting at [`Epoch::INITIAL`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: AtomicU32::new(Epoch::INITIAL.raw()),
        }
    }

    /// Current global epoch.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Epoch {
        Epoch::from_raw(self.current.load(Ordering::Acquire))
    }

    /// Advance by one epoch and return the new value.
    pub fn advance(&self) -> Epoch {
        loop {
            let observed = self.current.load(Ordering::Acquire);
            let next = Epoch::from_raw(observed).one_more();
            if self
                .current
                .compare_exchange_weak(
                    observed,
                    next.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Ensure the global epoch is strictly greater than `epoch`.
    ///
    /// Used by commit-wait: once the global epoch has moved past a commit
    /// epoch, that epoch is closed and handed to the logger.
    pub fn advance_past(&self, epoch: Epoch) -> Epoch {
        let mut current = self.current();
        while current <= epoch {
            current = self.advance();
        }
        current
    }
}

impl Default for GlobalEpoch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_is_valid() {
        assert!(Epoch::INITIAL.is_valid());
        assert!(!Epoch::default().is_valid());
    }

    #[test]
    fn test_one_more_skips_zero() {
        let last = Epoch::from_raw(MAX_EPOCH);
        assert_eq!(last.one_more(), Epoch::INITIAL);
    }

    #[test]
    fn test_ordering() {
        let a = Epoch::from_raw(5);
        let b = Epoch::from_raw(9);
        assert!(a < b);
        assert_eq!(a.max_of(b), b);
        assert_eq!(b.max_of(a), b);
    }

    #[test]
    fn test_global_advance() {
        let global = GlobalEpoch::new();
        let before = global.current();
        let after = global.advance();
        assert!(after > before);
    }

    #[test]
    fn test_advance_past() {
        let global = GlobalEpoch::new();
        let target = Epoch::from_raw(10);
        let reached = global.advance_past(target);
        assert!(reached > target);
        assert!(global.current() > target);
    }
}
