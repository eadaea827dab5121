//! Error codes returned by engine operations.
//!
//! Every fallible engine function returns [`EngineResult`], a plain
//! `Result` over [`ErrorCode`]. There are three classes:
//!
//! - *Transient:* [`ErrorCode::Retry`] and optimistic-validation misses.
//!   `Retry` is consumed by the innermost caller that can restart a
//!   traversal or a precommit; it never crosses the crate boundary.
//! - *User:* `NotFound`, `BufferTooSmall`, `TooShortPayload`, and friends.
//!   Returned verbatim; the only side effect left behind is the worker's
//!   log-buffer reservation, which the abort path rolls back.
//! - *Fatal:* `NoFreePages`, invariant violations. The transaction aborts
//!   and the error bubbles up to the host.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, ErrorCode>;

/// Error classification of engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// The requested key, offset, or storage does not exist.
    #[error("key or storage not found")]
    NotFound,

    /// A storage with this name or id already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Internal retry request: the reader observed a moved record or a
    /// structural change mid-descent. Consumed by the traversal loops and
    /// never surfaced to the caller of a storage operation.
    #[error("internal retry")]
    Retry,

    /// Precommit validation failed: a read-set, pointer-set, or node-set
    /// entry changed, or a write-set lock observed a moved record.
    #[error("serialization conflict detected at precommit")]
    Conflict,

    /// The node's page pool is exhausted.
    #[error("no free pages in the volatile page pool")]
    NoFreePages,

    /// The payload does not fit in a page even after a split.
    #[error("payload too long: {length} bytes")]
    TooLongPayload {
        /// Requested payload length.
        length: usize,
    },

    /// A partial read or overwrite extends beyond the stored payload.
    #[error("payload shorter than requested range")]
    TooShortPayload,

    /// The output buffer cannot hold the stored payload.
    #[error("buffer too small: payload is {required} bytes, buffer holds {capacity}")]
    BufferTooSmall {
        /// Stored payload length.
        required: usize,
        /// Capacity the caller supplied.
        capacity: usize,
    },

    /// A configuration value is outside its permitted range.
    #[error("configuration value out of range: {0}")]
    ConfValueOutOfRange(String),

    /// The operation reached a code path that is not implemented, such as
    /// faulting in a snapshot-only page.
    #[error("not implemented")]
    NotImplemented,

    /// The worker's log buffer cannot hold the redo record.
    /// Distinct from `BufferTooSmall`, which concerns the caller's buffer.
    #[error("log buffer full: need {needed} more bytes")]
    LogBufferFull {
        /// Bytes the reservation needed beyond the remaining capacity.
        needed: usize,
    },

    /// An engine API was used before `initialize()` or after
    /// `uninitialize()`, or a transaction API was misused.
    #[error("invalid engine or transaction state: {0}")]
    InvalidState(&'static str),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorCode {
    /// True for errors the caller may retry after backing off.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Retry | Self::Conflict)
    }
}
