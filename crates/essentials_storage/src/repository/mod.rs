//! # Repositories
//!
//! Repositories move opaque document bytes to and from a backing store. They
//! never interpret document contents; parsing, migration and caching all live
//! above them in the storage services.
//!
//! Implementations must satisfy:
//! - `load` returns `Ok(None)` when no document exists for the key (an empty
//!   stored document counts as none), and `Err` only on I/O failure.
//! - `save` replaces the stored document atomically from the caller's point
//!   of view.
//! - All methods are safe to call concurrently.
//!
//! Two backends ship with the crate: [`FlatFileRepository`] (one JSON file per
//! key under a data directory) and [`InMemoryRepository`] (tests and
//! embedding).

mod flat_file;
mod memory;

pub use flat_file::{FlatFileRepository, FlatFileSingleRepository};
pub(crate) use flat_file::write_document;
pub use memory::{InMemoryRepository, InMemorySingleRepository};

use crate::error::{StorageError, StorageResult};
use crate::types::{PlayerId, WorldKey};
use async_trait::async_trait;
use std::fmt::Display;
use std::hash::Hash;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Requirements on the identifier of a keyed document.
pub trait StorageKey: Clone + Eq + Hash + Display + Send + Sync + 'static {}

impl<T> StorageKey for T where T: Clone + Eq + Hash + Display + Send + Sync + 'static {}

/// Byte store for documents addressed by a key.
#[async_trait]
pub trait KeyedRepository<K: StorageKey>: Send + Sync {
    async fn exists(&self, key: &K) -> StorageResult<bool>;

    async fn load(&self, key: &K) -> StorageResult<Option<Vec<u8>>>;

    async fn save(&self, key: &K, data: &[u8]) -> StorageResult<()>;

    /// Returns true if a document existed.
    async fn delete(&self, key: &K) -> StorageResult<bool>;

    /// Every key with a stored document.
    async fn keys(&self) -> StorageResult<Vec<K>>;

    async fn count(&self) -> StorageResult<usize> {
        Ok(self.keys().await?.len())
    }

    /// Drops any repository-side caching. No-op for backends without one.
    async fn clear_cache(&self) {}

    /// Short backend description for logs.
    fn describe(&self) -> String;
}

/// Byte store for a single, unkeyed document.
#[async_trait]
pub trait SingleRepository: Send + Sync {
    async fn exists(&self) -> StorageResult<bool>;

    async fn load(&self) -> StorageResult<Option<Vec<u8>>>;

    async fn save(&self, data: &[u8]) -> StorageResult<()>;

    async fn delete(&self) -> StorageResult<bool>;

    async fn clear_cache(&self) {}

    fn describe(&self) -> String;
}

/// Keys that map to a relative file path under a flat-file data directory.
pub trait FileKey: StorageKey {
    /// Path of the key's document relative to the repository directory.
    /// Fails for keys that would resolve outside of it.
    fn relative_path(&self) -> StorageResult<PathBuf>;

    /// Inverse of [`relative_path`](Self::relative_path). `None` for files
    /// that do not belong to this key space.
    fn from_relative_path(path: &Path) -> Option<Self>;
}

const DOCUMENT_EXTENSION: &str = "json";

/// Splits `dir/name.json` into `("dir", "name")`.
fn split_document_path(path: &Path) -> Option<(&str, &str)> {
    let mut components = path.components();
    let dir = match components.next()? {
        Component::Normal(dir) => dir.to_str()?,
        _ => return None,
    };
    let file = match components.next()? {
        Component::Normal(file) => Path::new(file),
        _ => return None,
    };
    if components.next().is_some() || file.extension()?.to_str()? != DOCUMENT_EXTENSION {
        return None;
    }
    Some((dir, file.file_stem()?.to_str()?))
}

/// Player documents are sharded by the first two characters of the UUID:
/// `ab/abcdef01-....json`.
impl FileKey for PlayerId {
    fn relative_path(&self) -> StorageResult<PathBuf> {
        let id = self.0.to_string();
        Ok(PathBuf::from(&id[..2]).join(format!("{}.{}", id, DOCUMENT_EXTENSION)))
    }

    fn from_relative_path(path: &Path) -> Option<Self> {
        let (shard, stem) = split_document_path(path)?;
        let id = Uuid::parse_str(stem).ok()?;
        let player = PlayerId(id);
        (player.0.to_string().get(..2) == Some(shard)).then_some(player)
    }
}

/// World documents live at `namespace/value.json`.
impl FileKey for WorldKey {
    fn relative_path(&self) -> StorageResult<PathBuf> {
        if !self.is_valid() {
            return Err(StorageError::InvalidKey(format!("world key '{}'", self)));
        }
        Ok(PathBuf::from(&self.namespace).join(format!("{}.{}", self.value, DOCUMENT_EXTENSION)))
    }

    fn from_relative_path(path: &Path) -> Option<Self> {
        let (namespace, value) = split_document_path(path)?;
        let key = WorldKey::new(namespace, value);
        key.is_valid().then_some(key)
    }
}
