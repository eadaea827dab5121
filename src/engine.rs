//! Engine lifecycle and storage management.
//!
//! The [`Engine`] owns the process-wide state: page pools, the global
//! epoch, and the storage registry, bracketed by `initialize()` and
//! `uninitialize()`. Use of any API before init or after teardown is a
//! programming error and returns `InvalidState`.
//!
//! Worker threads are owned by the host; `attach_thread` hands out a
//! [`ThreadContext`] pinned to a node. Storage DDL (create/drop) is
//! single-writer under the engine's DDL lock and publishes a metadata
//! savepoint at each change.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::array::ArrayStorage;
use crate::config::EngineOptions;
use crate::epoch::{Epoch, GlobalEpoch};
use crate::error::{EngineResult, ErrorCode};
use crate::masstree::MasstreeStorage;
use crate::memory::PagePools;
use crate::page::{StorageId, PAGE_SIZE};
use crate::storage::{Metadata, SavepointDocument, StorageRef, StorageRegistry};
use crate::thread::ThreadContext;

/// Process-wide engine state shared by all thread contexts.
pub(crate) struct EngineInner {
    options: EngineOptions,
    pools: PagePools,
    epoch: GlobalEpoch,
    registry: StorageRegistry,
    next_storage_id: AtomicU32,
    initialized: AtomicBool,
    /// Serializes create/drop and savepoint writes.
    ddl_lock: Mutex<()>,
}

impl EngineInner {
    #[inline]
    pub(crate) fn options(&self) -> &EngineOptions {
        &self.options
    }

    #[inline]
    pub(crate) fn pools(&self) -> &PagePools {
        &self.pools
    }

    #[inline]
    pub(crate) fn global_epoch(&self) -> &GlobalEpoch {
        &self.epoch
    }

    #[inline]
    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

// ============================================================================
//  Engine
// ============================================================================

/// The in-memory transactional storage engine.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Construct an engine, validating the configuration and allocating
    /// the per-node page arenas.
    pub fn new(options: EngineOptions) -> EngineResult<Self> {
        options.validate()?;
        let pool_bytes = options.memory.page_pool_size_mb_per_node as usize * 1024 * 1024;
        debug_assert!(pool_bytes >= 2 * PAGE_SIZE);
        let pools = PagePools::new(options.thread.group_count, pool_bytes)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                options,
                pools,
                epoch: GlobalEpoch::new(),
                registry: StorageRegistry::new(),
                next_storage_id: AtomicU32::new(1),
                initialized: AtomicBool::new(false),
                ddl_lock: Mutex::new(()),
            }),
        })
    }

    /// Bring the engine up.
    pub fn initialize(&self) -> EngineResult<()> {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Err(ErrorCode::InvalidState("engine already initialized"));
        }
        tracing::info!(
            nodes = self.inner.options.thread.group_count,
            workers_per_node = self.inner.options.thread.thread_count_per_group,
            pool_mb_per_node = self.inner.options.memory.page_pool_size_mb_per_node,
            "engine initialized"
        );
        Ok(())
    }

    /// Tear the engine down: write a final savepoint, release every
    /// storage's pages, and reject further API use.
    pub fn uninitialize(&self) -> EngineResult<()> {
        let _ddl = self.inner.ddl_lock.lock();
        if !self.inner.is_initialized() {
            return Err(ErrorCode::InvalidState("engine not initialized"));
        }
        if self.inner.options.log.flush_at_shutdown {
            self.write_savepoint_locked()?;
        }
        for storage in self.inner.registry.list() {
            let storage = self.inner.registry.deregister(storage.id())?;
            storage.mark_dropped();
            storage.release_pages(&self.inner.pools);
        }
        self.inner.initialized.store(false, Ordering::Release);
        tracing::info!("engine uninitialized");
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    #[inline]
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    #[inline]
    #[must_use]
    pub fn current_global_epoch(&self) -> Epoch {
        self.inner.epoch.current()
    }

    /// Fraction of page-pool slots currently free, for the snapshot
    /// trigger (`snapshot.snapshot_trigger_page_pool_percent`).
    #[must_use]
    pub fn free_page_percent(&self) -> u8 {
        self.inner.pools.free_percent()
    }

    /// Attach a worker context pinned to `node`.
    pub fn attach_thread(&self, node: u16, ordinal: u16) -> EngineResult<ThreadContext> {
        if !self.inner.is_initialized() {
            return Err(ErrorCode::InvalidState("engine not initialized"));
        }
        let thread = &self.inner.options.thread;
        if node >= thread.group_count || ordinal >= thread.thread_count_per_group {
            return Err(ErrorCode::ConfValueOutOfRange(format!(
                "thread ({node}, {ordinal}) beyond configured ({}, {})",
                thread.group_count, thread.thread_count_per_group
            )));
        }
        let thread_id = node * thread.thread_count_per_group + ordinal;
        Ok(ThreadContext::new(
            Arc::clone(&self.inner),
            node as u8,
            thread_id,
        ))
    }

    /// Wait until the given commit epoch is closed (see
    /// [`ThreadContext::wait_for_commit`]).
    pub fn wait_for_commit(&self, commit_epoch: Epoch) -> EngineResult<Epoch> {
        if !self.inner.is_initialized() {
            return Err(ErrorCode::InvalidState("engine not initialized"));
        }
        Ok(self.inner.epoch.advance_past(commit_epoch))
    }

    // ========================================================================
    //  Storage management
    // ========================================================================

    /// Create a storage from metadata (the id field is assigned here).
    /// Returns the handle and the commit epoch of the change.
    pub fn create_storage(
        &self,
        context: &mut ThreadContext,
        mut metadata: Metadata,
    ) -> EngineResult<(StorageRef, Epoch)> {
        if !self.inner.is_initialized() {
            return Err(ErrorCode::InvalidState("engine not initialized"));
        }
        if metadata.name().is_empty() {
            return Err(ErrorCode::ConfValueOutOfRange(
                "storage name must be non-empty".to_string(),
            ));
        }
        let _ddl = self.inner.ddl_lock.lock();
        if self.inner.registry.get_by_name(metadata.name()).is_ok() {
            return Err(ErrorCode::AlreadyExists(metadata.name().to_string()));
        }
        let id: StorageId = self.inner.next_storage_id.fetch_add(1, Ordering::AcqRel);
        metadata.set_id(id);
        let storage = match metadata {
            Metadata::Array(meta) => {
                StorageRef::Array(Arc::new(ArrayStorage::create(context, meta)?))
            }
            Metadata::Masstree(meta) => {
                StorageRef::Masstree(Arc::new(MasstreeStorage::create(context, meta)?))
            }
        };
        self.inner.registry.register(storage.clone())?;
        let commit_epoch = self.inner.epoch.advance();
        self.write_savepoint_locked()?;
        Ok((storage, commit_epoch))
    }

    /// Drop a storage and release its pages. Returns the commit epoch of
    /// the change.
    pub fn drop_storage(&self, id: StorageId) -> EngineResult<Epoch> {
        if !self.inner.is_initialized() {
            return Err(ErrorCode::InvalidState("engine not initialized"));
        }
        let _ddl = self.inner.ddl_lock.lock();
        let storage = self.inner.registry.deregister(id)?;
        tracing::info!(id, name = %storage.name(), "dropping storage");
        storage.mark_dropped();
        storage.release_pages(&self.inner.pools);
        let commit_epoch = self.inner.epoch.advance();
        self.write_savepoint_locked()?;
        Ok(commit_epoch)
    }

    /// Look up a storage by id.
    pub fn get_storage(&self, id: StorageId) -> EngineResult<StorageRef> {
        self.inner.registry.get(id)
    }

    /// Look up a storage by name.
    pub fn get_storage_by_name(&self, name: &str) -> EngineResult<StorageRef> {
        self.inner.registry.get_by_name(name)
    }

    /// Write a metadata savepoint now.
    pub fn take_savepoint(&self) -> EngineResult<()> {
        let _ddl = self.inner.ddl_lock.lock();
        self.write_savepoint_locked()
    }

    fn write_savepoint_locked(&self) -> EngineResult<()> {
        let path = &self.inner.options.savepoint.savepoint_path;
        if path.is_empty() {
            return Ok(());
        }
        let document = SavepointDocument {
            epoch: self.inner.epoch.current().raw(),
            storages: self
                .inner
                .registry
                .list()
                .iter()
                .map(StorageRef::metadata)
                .collect(),
        };
        document.write_to(Path::new(path))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.inner.is_initialized() {
            tracing::warn!("engine dropped while initialized; uninitializing");
            let _ = self.uninitialize();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("initialized", &self.inner.is_initialized())
            .field("storages", &self.inner.registry.list().len())
            .finish()
    }
}
