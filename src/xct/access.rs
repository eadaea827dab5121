//! Per-transaction access sets.
//!
//! All four sets are append-only within a transaction and discarded on
//! abort. Entries identify records and pointers by raw address; the
//! addresses stay valid because pages are arena slots that are never
//! released while a storage is live.

use std::sync::atomic::AtomicU64;

use crate::page::StorageId;
use crate::version::{PageVersion, VersionSnapshot};
use crate::xct::id::{OwnerId, XctId};

/// Read-set entry: an owner-id observation to re-validate at precommit.
#[derive(Debug, Clone, Copy)]
pub struct ReadAccess {
    pub storage_id: StorageId,
    /// Address of the record's owner-id cell.
    pub owner_address: *const OwnerId,
    /// The id observed by the optimistic read protocol.
    pub observed: XctId,
}

/// Write-set entry: a staged mutation applied at precommit.
#[derive(Debug, Clone, Copy)]
pub struct WriteAccess {
    pub storage_id: StorageId,
    /// Address of the record's owner-id cell (the lock to take).
    pub owner_address: *const OwnerId,
    /// Address of the record's payload bytes.
    pub payload_address: *mut u8,
    /// Index of the redo record in the worker's log buffer.
    pub log_index: usize,
}

/// Pointer-set entry: a swappable pointer observation for root-swap
/// detection.
#[derive(Debug, Clone, Copy)]
pub struct PointerAccess {
    /// Address of the volatile-pointer cell.
    pub pointer_address: *const AtomicU64,
    /// The word observed during traversal.
    pub observed: u64,
}

/// Node-set entry: a version-word observation at a leaf boundary.
///
/// This is the (acknowledged incomplete) phantom guard: a not-found
/// result records the border page version so a concurrent insert into
/// the scanned range fails the transaction at precommit.
#[derive(Debug, Clone, Copy)]
pub struct NodeAccess {
    /// Address of the page or minipage version word.
    pub version_address: *const PageVersion,
    /// The stable snapshot observed.
    pub observed: VersionSnapshot,
}

// Raw addresses into arena-backed pages; the worker that owns the
// transaction is the only accessor of these vectors.
unsafe impl Send for ReadAccess {}
unsafe impl Send for WriteAccess {}
unsafe impl Send for PointerAccess {}
unsafe impl Send for NodeAccess {}

impl ReadAccess {
    #[inline]
    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        // SAFETY: the owner cell lives in an arena page that outlives the
        // transaction.
        unsafe { &*self.owner_address }
    }
}

impl WriteAccess {
    #[inline]
    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        // SAFETY: as in `ReadAccess::owner`.
        unsafe { &*self.owner_address }
    }
}

impl PointerAccess {
    #[inline]
    #[must_use]
    pub fn cell(&self) -> &AtomicU64 {
        // SAFETY: the pointer cell lives in storage or page memory that
        // outlives the transaction.
        unsafe { &*self.pointer_address }
    }
}

impl NodeAccess {
    #[inline]
    #[must_use]
    pub fn version(&self) -> &PageVersion {
        // SAFETY: the version word lives in an arena page that outlives
        // the transaction.
        unsafe { &*self.version_address }
    }
}
