//! Storage metadata, the storage registry, and metadata savepoints.
//!
//! The registry maps storage id (dense small integers) and unique name
//! to a [`StorageRef`], a tagged variant over the storage kinds. Each
//! variant exposes the common capability set (`id`, `name`, `exists`,
//! `metadata`) and call sites dispatch statically per operation.
//! Registration is single-writer (the engine's create/drop path holds
//! the DDL lock); readers take a snapshot-consistent view published at
//! each metadata change.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::array::ArrayStorage;
use crate::error::{EngineResult, ErrorCode};
use crate::masstree::MasstreeStorage;
use crate::page::StorageId;

// ============================================================================
//  Metadata
// ============================================================================

/// Metadata of an array storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArrayMetadata {
    pub id: StorageId,
    pub name: String,
    /// Byte size of one record's payload.
    pub payload_size: u16,
    /// Number of records (the offset space is `0..array_size`).
    pub array_size: u64,
    /// Root page id captured at the last savepoint.
    pub root_page_id: u64,
}

impl ArrayMetadata {
    /// Metadata for a new storage; the engine assigns the id at create.
    #[must_use]
    pub fn new(name: impl Into<String>, payload_size: u16, array_size: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            payload_size,
            array_size,
            root_page_id: 0,
        }
    }
}

/// Metadata of a masstree storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasstreeMetadata {
    pub id: StorageId,
    pub name: String,
    /// Root page id captured at the last savepoint.
    pub root_page_id: u64,
}

impl MasstreeMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            root_page_id: 0,
        }
    }
}

/// Tagged metadata for the savepoint document and the create API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Metadata {
    Array(ArrayMetadata),
    Masstree(MasstreeMetadata),
}

impl Metadata {
    #[must_use]
    pub fn id(&self) -> StorageId {
        match self {
            Self::Array(m) => m.id,
            Self::Masstree(m) => m.id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Array(m) => &m.name,
            Self::Masstree(m) => &m.name,
        }
    }

    pub(crate) fn set_id(&mut self, id: StorageId) {
        match self {
            Self::Array(m) => m.id = id,
            Self::Masstree(m) => m.id = id,
        }
    }
}

// ============================================================================
//  StorageRef
// ============================================================================

/// A handle to a registered storage.
#[derive(Debug, Clone)]
pub enum StorageRef {
    Array(Arc<ArrayStorage>),
    Masstree(Arc<MasstreeStorage>),
}

impl PartialEq for StorageRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl StorageRef {
    #[must_use]
    pub fn id(&self) -> StorageId {
        match self {
            Self::Array(s) => s.id(),
            Self::Masstree(s) => s.id(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Array(s) => s.name(),
            Self::Masstree(s) => s.name(),
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        match self {
            Self::Array(s) => s.exists(),
            Self::Masstree(s) => s.exists(),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.exists()
    }

    /// A metadata snapshot with the current root page id (root pointers
    /// may have been swapped by tree growth since creation).
    #[must_use]
    pub fn metadata(&self) -> Metadata {
        match self {
            Self::Array(s) => {
                let mut meta = s.metadata().clone();
                meta.root_page_id = s.root_page_id();
                Metadata::Array(meta)
            }
            Self::Masstree(s) => {
                let mut meta = s.metadata().clone();
                meta.root_page_id = s.root_page_id();
                Metadata::Masstree(meta)
            }
        }
    }

    /// The array handle, or `NotFound` when the kinds mismatch.
    pub fn as_array(&self) -> EngineResult<&Arc<ArrayStorage>> {
        match self {
            Self::Array(s) => Ok(s),
            Self::Masstree(_) => Err(ErrorCode::NotFound),
        }
    }

    /// The masstree handle, or `NotFound` when the kinds mismatch.
    pub fn as_masstree(&self) -> EngineResult<&Arc<MasstreeStorage>> {
        match self {
            Self::Masstree(s) => Ok(s),
            Self::Array(_) => Err(ErrorCode::NotFound),
        }
    }

    pub(crate) fn mark_dropped(&self) {
        match self {
            Self::Array(s) => s.mark_dropped(),
            Self::Masstree(s) => s.mark_dropped(),
        }
    }

    pub(crate) fn release_pages(&self, pools: &crate::memory::PagePools) {
        match self {
            Self::Array(s) => s.release_pages(pools),
            Self::Masstree(s) => s.release_pages(pools),
        }
    }
}

// ============================================================================
//  StorageRegistry
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    by_id: Vec<Option<StorageRef>>,
    by_name: HashMap<String, StorageId>,
}

/// The engine's storage registry.
#[derive(Default)]
pub struct StorageRegistry {
    inner: RwLock<RegistryInner>,
}

impl StorageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage. The engine's DDL lock makes this single-writer.
    pub fn register(&self, storage: StorageRef) -> EngineResult<()> {
        let mut inner = self.inner.write();
        let id = storage.id();
        let name = storage.name().to_string();
        if inner.by_name.contains_key(&name) {
            return Err(ErrorCode::AlreadyExists(name));
        }
        let index = id as usize;
        if inner.by_id.len() <= index {
            inner.by_id.resize_with(index + 1, || None);
        }
        if inner.by_id[index].is_some() {
            return Err(ErrorCode::AlreadyExists(format!("storage id {id}")));
        }
        inner.by_id[index] = Some(storage);
        inner.by_name.insert(name, id);
        Ok(())
    }

    /// Remove a storage, returning its handle for page release.
    pub fn deregister(&self, id: StorageId) -> EngineResult<StorageRef> {
        let mut inner = self.inner.write();
        let slot = inner
            .by_id
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(ErrorCode::NotFound)?;
        inner.by_name.remove(slot.name());
        Ok(slot)
    }

    pub fn get(&self, id: StorageId) -> EngineResult<StorageRef> {
        self.inner
            .read()
            .by_id
            .get(id as usize)
            .and_then(Clone::clone)
            .ok_or(ErrorCode::NotFound)
    }

    pub fn get_by_name(&self, name: &str) -> EngineResult<StorageRef> {
        let inner = self.inner.read();
        let id = *inner.by_name.get(name).ok_or(ErrorCode::NotFound)?;
        inner
            .by_id
            .get(id as usize)
            .and_then(Clone::clone)
            .ok_or(ErrorCode::NotFound)
    }

    /// Snapshot of all registered storages, in id order.
    #[must_use]
    pub fn list(&self) -> Vec<StorageRef> {
        self.inner
            .read()
            .by_id
            .iter()
            .filter_map(Clone::clone)
            .collect()
    }
}

// ============================================================================
//  Savepoint
// ============================================================================

/// The human-readable metadata document written at each savepoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SavepointDocument {
    /// Global epoch at the time of the savepoint.
    pub epoch: u32,
    /// All registered storages.
    pub storages: Vec<Metadata>,
}

impl SavepointDocument {
    /// Write the document atomically (temp file plus rename).
    pub fn write_to(&self, path: &Path) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ErrorCode::Internal(format!("savepoint serialize: {e}")))?;
        let tmp_path = path.with_extension("tmp");
        let io_err = |e: std::io::Error| ErrorCode::Internal(format!("savepoint write: {e}"));
        let mut file = std::fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        std::fs::rename(&tmp_path, path).map_err(io_err)?;
        tracing::info!(path = %path.display(), storages = self.storages.len(), "savepoint written");
        Ok(())
    }

    /// Read a previously written document.
    pub fn read_from(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ErrorCode::Internal(format!("savepoint read: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| ErrorCode::Internal(format!("savepoint parse: {e}")))
    }
}

// ============================================================================
//  Primitive payloads
// ============================================================================

mod sealed {
    pub trait Sealed {}
}

/// The closed set of primitive payload types usable with the
/// `*_primitive` storage operations.
///
/// Payloads are still byte arrays; the primitive forms assert size and
/// use little-endian byte order on the record.
pub trait Primitive: Copy + std::ops::Add<Output = Self> + sealed::Sealed {
    /// Byte size of the type on the record.
    const SIZE: usize;

    /// Serialize into the record representation.
    fn to_payload_bytes(self) -> [u8; 8];

    /// Deserialize from the record representation.
    ///
    /// Only the first [`Primitive::SIZE`] bytes of `bytes` are meaningful.
    fn from_payload_bytes(bytes: [u8; 8]) -> Self;
}

macro_rules! impl_primitive {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Primitive for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn to_payload_bytes(self) -> [u8; 8] {
                let mut out = [0u8; 8];
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                out
            }

            #[inline]
            fn from_payload_bytes(bytes: [u8; 8]) -> Self {
                let mut raw = [0u8; Self::SIZE];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$t>::from_le_bytes(raw)
            }
        }
    )*};
}

impl_primitive!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_tagging() {
        let meta = Metadata::Masstree(MasstreeMetadata::new("ggg"));
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"type\":\"masstree\""));
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name(), "ggg");
    }

    #[test]
    fn test_primitive_round_trip() {
        fn check<T: Primitive + PartialEq + std::fmt::Debug>(value: T) {
            assert_eq!(T::from_payload_bytes(value.to_payload_bytes()), value);
        }
        check(0xABu8);
        check(-12345i32);
        check(897_565_433_333_126u64);
        check(3.5f64);
    }

    #[test]
    fn test_savepoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("savepoint.json");
        let doc = SavepointDocument {
            epoch: 7,
            storages: vec![
                Metadata::Array(ArrayMetadata::new("arr", 8, 16)),
                Metadata::Masstree(MasstreeMetadata::new("tree")),
            ],
        };
        doc.write_to(&path).unwrap();
        let back = SavepointDocument::read_from(&path).unwrap();
        assert_eq!(back.epoch, 7);
        assert_eq!(back.storages.len(), 2);
        assert_eq!(back.storages[1].name(), "tree");
    }
}
