//! Worker thread contexts.
//!
//! The engine does not own a thread pool; the host creates and pins OS
//! threads (one per NUMA core) and attaches a [`ThreadContext`] to each
//! via `Engine::attach_thread`. The context bundles everything a worker
//! needs: its node's page pool, its transaction state, and its redo log
//! buffer. Storage operations take `&mut ThreadContext`; the context is
//! not shareable between threads.

use std::sync::Arc;

use crate::engine::EngineInner;
use crate::epoch::Epoch;
use crate::error::{EngineResult, ErrorCode};
use crate::page::VolatilePointer;
use crate::xct::log::{RedoLog, ThreadLogBuffer};
use crate::xct::{IsolationLevel, Xct};

/// A worker's engine attachment.
pub struct ThreadContext {
    engine: Arc<EngineInner>,
    node: u8,
    thread_id: u16,
    xct: Xct,
    log_buffer: ThreadLogBuffer,
}

impl ThreadContext {
    pub(crate) fn new(engine: Arc<EngineInner>, node: u8, thread_id: u16) -> Self {
        let log_buffer = ThreadLogBuffer::new(engine.options().log.log_buffer_kb);
        Self {
            engine,
            node,
            thread_id,
            xct: Xct::new(thread_id),
            log_buffer,
        }
    }

    #[inline]
    #[must_use]
    pub const fn node(&self) -> u8 {
        self.node
    }

    #[inline]
    #[must_use]
    pub const fn thread_id(&self) -> u16 {
        self.thread_id
    }

    #[inline]
    #[must_use]
    pub fn current_global_epoch(&self) -> Epoch {
        self.engine.global_epoch().current()
    }

    // ========================================================================
    //  Transaction API
    // ========================================================================

    /// Begin a serializable transaction.
    pub fn begin_xct(&mut self, isolation: IsolationLevel) -> EngineResult<()> {
        if !self.engine.is_initialized() {
            return Err(ErrorCode::InvalidState("engine not initialized"));
        }
        let epoch = self.engine.global_epoch().current();
        self.xct.activate(isolation, epoch)
    }

    /// Run the precommit pipeline; returns the commit epoch.
    pub fn precommit_xct(&mut self) -> EngineResult<Epoch> {
        let engine = Arc::clone(&self.engine);
        self.xct
            .precommit(engine.global_epoch(), &mut self.log_buffer)
    }

    /// Abort the current transaction, rolling back log reservations.
    pub fn abort_xct(&mut self) -> EngineResult<()> {
        self.xct.abort(&mut self.log_buffer)
    }

    /// Wait until the given commit epoch is closed.
    ///
    /// The core has no durable log; closing the epoch hands the records
    /// to the external logger, which flushes asynchronously.
    pub fn wait_for_commit(&self, commit_epoch: Epoch) -> EngineResult<Epoch> {
        if !self.engine.is_initialized() {
            return Err(ErrorCode::InvalidState("engine not initialized"));
        }
        Ok(self.engine.global_epoch().advance_past(commit_epoch))
    }

    /// Hand the committed log prefix to the caller (the external logger).
    pub fn drain_committed_log(&mut self) -> Vec<RedoLog> {
        self.log_buffer.drain_committed()
    }

    #[must_use]
    pub fn is_in_xct(&self) -> bool {
        self.xct.is_active()
    }

    // ========================================================================
    //  Crate-internal plumbing
    // ========================================================================

    #[inline]
    pub(crate) fn engine(&self) -> &Arc<EngineInner> {
        &self.engine
    }

    /// Grab a free page from this worker's node pool.
    pub(crate) fn grab_free_page(&self) -> EngineResult<VolatilePointer> {
        self.engine.pools().grab_on(self.node)
    }

    /// Return a page grabbed but never published.
    pub(crate) fn release_free_page(&self, pointer: VolatilePointer) {
        self.engine
            .pools()
            .pool(pointer.node())
            .release(pointer.offset());
    }

    /// Resolve a volatile pointer through the global resolver.
    #[inline]
    pub(crate) fn resolve(&self, pointer: VolatilePointer) -> *mut u8 {
        self.engine.pools().resolve(pointer)
    }

    #[inline]
    pub(crate) fn xct_mut(&mut self) -> &mut Xct {
        &mut self.xct
    }

    /// Split borrow for call sites that stage a log record and a
    /// write-set entry in one step.
    #[inline]
    pub(crate) fn xct_and_log(&mut self) -> (&mut Xct, &mut ThreadLogBuffer) {
        (&mut self.xct, &mut self.log_buffer)
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("node", &self.node)
            .field("thread_id", &self.thread_id)
            .field("in_xct", &self.xct.is_active())
            .finish()
    }
}
