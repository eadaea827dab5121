//! Standard memory orderings for concurrent page access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading page fields during optimistic traversal.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing page fields under lock.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (version lock, owner-id lock, root swap).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure. Only needs to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for relaxed loads/stores within a locked region.
/// Safe because the version lock provides synchronization.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for the full fence between write-set lock acquisition and
/// commit-epoch assignment in precommit.
pub const COMMIT_FENCE: Ordering = Ordering::SeqCst;
