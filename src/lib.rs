//! # Ironwood
//!
//! An in-memory transactional storage engine offering serializable
//! access to multiple indexed data structures:
//!
//! - A **Masstree** ordered index: a trie of B+trees over
//!   variable-length byte keys, with lock-free descent, foster-child
//!   splits, and layered handling of long keys.
//! - An **array** index: a fixed-fanout, fixed-depth tree over an
//!   integer offset space, sharing the same transactional write path.
//!
//! Both sit on an optimistic concurrency protocol: reads validate
//! per-record owner-id words, writes are staged as redo records in
//! per-worker log buffers, and precommit locks the write-set in address
//! order, assigns a commit epoch and ordinal, validates every
//! observation, and publishes the new versions.
//!
//! ## Usage
//!
//! ```rust
//! use ironwood::config::EngineOptions;
//! use ironwood::engine::Engine;
//! use ironwood::storage::{ArrayMetadata, Metadata};
//! use ironwood::xct::IsolationLevel;
//!
//! let engine = Engine::new(EngineOptions::tiny()).unwrap();
//! engine.initialize().unwrap();
//! let mut context = engine.attach_thread(0, 0).unwrap();
//!
//! let (storage, _epoch) = engine
//!     .create_storage(
//!         &mut context,
//!         Metadata::Array(ArrayMetadata::new("counters", 8, 16)),
//!     )
//!     .unwrap();
//! let array = storage.as_array().unwrap();
//!
//! context.begin_xct(IsolationLevel::Serializable).unwrap();
//! array
//!     .overwrite_record_primitive::<u64>(&mut context, 3, 0x1234, 0)
//!     .unwrap();
//! let commit_epoch = context.precommit_xct().unwrap();
//! context.wait_for_commit(commit_epoch).unwrap();
//!
//! engine.uninitialize().unwrap();
//! ```

pub mod array;
pub mod config;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod key;
pub mod masstree;
pub mod memory;
pub mod ordering;
pub mod page;
pub mod storage;
pub mod thread;
pub mod version;
pub mod xct;

pub use config::EngineOptions;
pub use engine::Engine;
pub use epoch::Epoch;
pub use error::{EngineResult, ErrorCode};
pub use storage::{ArrayMetadata, MasstreeMetadata, Metadata, StorageRef};
pub use thread::ThreadContext;
pub use xct::IsolationLevel;
