//! Flat-file repositories: one pretty-printed JSON document per file.
//!
//! Writes go to a temporary sibling file that is renamed over the target, so a
//! crash mid-write never leaves a truncated document. With backups enabled the
//! previous version is copied to `<file>.bak` first.

use super::{FileKey, KeyedRepository, SingleRepository, DOCUMENT_EXTENSION};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Reads a document file. Missing and empty files both mean "no document".
async fn read_document(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Load(format!("failed to read {}: {}", path.display(), e))),
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub(crate) async fn write_document(path: &Path, data: &[u8], backup: bool) -> StorageResult<()> {
    let save_error = |e: std::io::Error| StorageError::Save(format!("failed to write {}: {}", path.display(), e));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(save_error)?;
    }

    if backup {
        match fs::copy(path, sibling_with_suffix(path, ".bak")).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("⚠️ Could not back up {}: {}", path.display(), e),
        }
    }

    let temp = sibling_with_suffix(path, ".tmp");
    fs::write(&temp, data).await.map_err(save_error)?;
    fs::rename(&temp, path).await.map_err(save_error)?;
    debug!("💾 Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

async fn delete_document(path: &Path) -> StorageResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Delete(format!("failed to delete {}: {}", path.display(), e))),
    }
}

/// Keyed repository storing each document at `base/<key.relative_path()>`.
pub struct FlatFileRepository<K> {
    base: PathBuf,
    backup_on_save: bool,
    write_lock: Mutex<()>,
    _keys: PhantomData<fn() -> K>,
}

impl<K: FileKey> FlatFileRepository<K> {
    pub fn new(base: impl Into<PathBuf>, backup_on_save: bool) -> Self {
        Self {
            base: base.into(),
            backup_on_save,
            write_lock: Mutex::new(()),
            _keys: PhantomData,
        }
    }

    pub fn base_directory(&self) -> &Path {
        &self.base
    }

    pub fn path_for(&self, key: &K) -> StorageResult<PathBuf> {
        Ok(self.base.join(key.relative_path()?))
    }

    async fn list_directory(path: &Path) -> StorageResult<Vec<(String, bool)>> {
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Query(format!("failed to list {}: {}", path.display(), e)))
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            if let Some(name) = entry.file_name().to_str() {
                names.push((name.to_string(), is_dir));
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl<K: FileKey> KeyedRepository<K> for FlatFileRepository<K> {
    async fn exists(&self, key: &K) -> StorageResult<bool> {
        Ok(fs::try_exists(self.path_for(key)?).await?)
    }

    async fn load(&self, key: &K) -> StorageResult<Option<Vec<u8>>> {
        read_document(&self.path_for(key)?).await
    }

    async fn save(&self, key: &K, data: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        write_document(&path, data, self.backup_on_save).await
    }

    async fn delete(&self, key: &K) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        delete_document(&path).await
    }

    async fn keys(&self) -> StorageResult<Vec<K>> {
        let mut keys = Vec::new();
        for (dir, is_dir) in Self::list_directory(&self.base).await? {
            if !is_dir {
                continue;
            }
            for (file, is_file_dir) in Self::list_directory(&self.base.join(&dir)).await? {
                if is_file_dir || !file.ends_with(DOCUMENT_EXTENSION) {
                    continue;
                }
                match K::from_relative_path(&Path::new(&dir).join(&file)) {
                    Some(key) => keys.push(key),
                    None => debug!("Skipping foreign file {}/{}", dir, file),
                }
            }
        }
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("flat files under {}", self.base.display())
    }
}

/// Single-document repository backed by one file.
pub struct FlatFileSingleRepository {
    path: PathBuf,
    backup_on_save: bool,
    write_lock: Mutex<()>,
}

impl FlatFileSingleRepository {
    pub fn new(path: impl Into<PathBuf>, backup_on_save: bool) -> Self {
        Self {
            path: path.into(),
            backup_on_save,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SingleRepository for FlatFileSingleRepository {
    async fn exists(&self) -> StorageResult<bool> {
        Ok(fs::try_exists(&self.path).await?)
    }

    async fn load(&self) -> StorageResult<Option<Vec<u8>>> {
        read_document(&self.path).await
    }

    async fn save(&self, data: &[u8]) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        write_document(&self.path, data, self.backup_on_save).await
    }

    async fn delete(&self) -> StorageResult<bool> {
        let _guard = self.write_lock.lock().await;
        delete_document(&self.path).await
    }

    fn describe(&self) -> String {
        format!("flat file {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlayerId, WorldKey};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = TempDir::new().unwrap();
        let repo: FlatFileRepository<PlayerId> = FlatFileRepository::new(dir.path(), false);
        let id = PlayerId::new();

        assert!(!repo.exists(&id).await.unwrap());
        assert_eq!(repo.load(&id).await.unwrap(), None);

        repo.save(&id, br#"{"content_version":2}"#).await.unwrap();
        assert!(repo.exists(&id).await.unwrap());
        assert_eq!(repo.load(&id).await.unwrap().unwrap(), br#"{"content_version":2}"#.to_vec());
        assert!(repo.path_for(&id).unwrap().starts_with(dir.path()));

        assert!(repo.delete(&id).await.unwrap());
        assert!(!repo.delete(&id).await.unwrap());
        assert_eq!(repo.load(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_file_is_no_document() {
        let dir = TempDir::new().unwrap();
        let repo: FlatFileRepository<WorldKey> = FlatFileRepository::new(dir.path(), false);
        let key = WorldKey::new("minecraft", "overworld");
        let path = repo.path_for(&key).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"  \n").unwrap();
        assert_eq!(repo.load(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_traversing_world_key_is_refused() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("data").join("worlds");
        let repo: FlatFileRepository<WorldKey> = FlatFileRepository::new(&base, false);
        let key = WorldKey::new("minecraft", "../../../escaped");

        let result = repo.save(&key, br#"{"content_version":1}"#).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        assert!(repo.load(&key).await.is_err());
        assert!(repo.exists(&key).await.is_err());
        assert!(!dir.path().join("escaped.json").exists());
        assert!(!dir.path().join("data").join("escaped.json").exists());
    }

    #[tokio::test]
    async fn test_backup_written_before_overwrite() {
        let dir = TempDir::new().unwrap();
        let repo = FlatFileSingleRepository::new(dir.path().join("kits.json"), true);
        repo.save(b"first").await.unwrap();
        repo.save(b"second").await.unwrap();

        assert_eq!(repo.load().await.unwrap().unwrap(), b"second".to_vec());
        let backup = std::fs::read(dir.path().join("kits.json.bak")).unwrap();
        assert_eq!(backup, b"first".to_vec());
        assert!(!dir.path().join("kits.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_keys_walks_shards() {
        let dir = TempDir::new().unwrap();
        let repo: FlatFileRepository<PlayerId> = FlatFileRepository::new(dir.path(), true);
        let ids: Vec<PlayerId> = (0..5).map(|_| PlayerId::new()).collect();
        for id in &ids {
            repo.save(id, b"{}").await.unwrap();
            // second save leaves a .bak next to the document
            repo.save(id, b"{}").await.unwrap();
        }
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let mut found = repo.keys().await.unwrap();
        found.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(found, expected);
        assert_eq!(repo.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_keys_of_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let repo: FlatFileRepository<WorldKey> =
            FlatFileRepository::new(dir.path().join("never-created"), false);
        assert!(repo.keys().await.unwrap().is_empty());
    }
}
