//! In-memory repositories for tests and embedding.
//!
//! Both keep load/save counters so callers can assert how often the backing
//! store was actually touched, and can be told to fail saves.

use super::{KeyedRepository, SingleRepository, StorageKey};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Counters {
    loads: AtomicUsize,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl Counters {
    fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::SeqCst);
    }

    fn record_save(&self, what: &str) -> StorageResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Save(format!("in-memory save rejected for {}", what)));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct InMemoryRepository<K: StorageKey> {
    documents: DashMap<K, Vec<u8>>,
    counters: Counters,
}

impl<K: StorageKey> InMemoryRepository<K> {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Stores raw bytes without touching the counters.
    pub fn insert_raw(&self, key: K, data: impl Into<Vec<u8>>) {
        self.documents.insert(key, data.into());
    }

    pub fn raw(&self, key: &K) -> Option<Vec<u8>> {
        self.documents.get(key).map(|entry| entry.value().clone())
    }

    pub fn load_count(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.counters.saves.load(Ordering::SeqCst)
    }

    /// Makes every subsequent save fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.counters.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl<K: StorageKey> Default for InMemoryRepository<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: StorageKey> KeyedRepository<K> for InMemoryRepository<K> {
    async fn exists(&self, key: &K) -> StorageResult<bool> {
        Ok(self.documents.contains_key(key))
    }

    async fn load(&self, key: &K) -> StorageResult<Option<Vec<u8>>> {
        self.counters.record_load();
        Ok(self
            .documents
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|bytes| !bytes.is_empty()))
    }

    async fn save(&self, key: &K, data: &[u8]) -> StorageResult<()> {
        self.counters.record_save(&key.to_string())?;
        self.documents.insert(key.clone(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &K) -> StorageResult<bool> {
        Ok(self.documents.remove(key).is_some())
    }

    async fn keys(&self) -> StorageResult<Vec<K>> {
        Ok(self.documents.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn count(&self) -> StorageResult<usize> {
        Ok(self.documents.len())
    }

    fn describe(&self) -> String {
        format!("in-memory ({} documents)", self.documents.len())
    }
}

#[derive(Default)]
pub struct InMemorySingleRepository {
    document: RwLock<Option<Vec<u8>>>,
    counters: Counters,
}

impl InMemorySingleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(data: impl Into<Vec<u8>>) -> Self {
        Self {
            document: RwLock::new(Some(data.into())),
            counters: Counters::default(),
        }
    }

    pub async fn raw(&self) -> Option<Vec<u8>> {
        self.document.read().await.clone()
    }

    pub fn load_count(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.counters.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.counters.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SingleRepository for InMemorySingleRepository {
    async fn exists(&self) -> StorageResult<bool> {
        Ok(self.document.read().await.is_some())
    }

    async fn load(&self) -> StorageResult<Option<Vec<u8>>> {
        self.counters.record_load();
        Ok(self.document.read().await.clone().filter(|bytes| !bytes.is_empty()))
    }

    async fn save(&self, data: &[u8]) -> StorageResult<()> {
        self.counters.record_save("single document")?;
        *self.document.write().await = Some(data.to_vec());
        Ok(())
    }

    async fn delete(&self) -> StorageResult<bool> {
        Ok(self.document.write().await.take().is_some())
    }

    fn describe(&self) -> String {
        "in-memory single document".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_and_failures() {
        let repo: InMemoryRepository<String> = InMemoryRepository::new();
        repo.save(&"a".to_string(), b"{}").await.unwrap();
        assert_eq!(repo.save_count(), 1);

        repo.set_fail_saves(true);
        assert!(matches!(
            repo.save(&"b".to_string(), b"{}").await,
            Err(StorageError::Save(_))
        ));
        assert_eq!(repo.save_count(), 1);
        assert!(!repo.exists(&"b".to_string()).await.unwrap());

        assert!(repo.load(&"a".to_string()).await.unwrap().is_some());
        assert!(repo.load(&"missing".to_string()).await.unwrap().is_none());
        assert_eq!(repo.load_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_document_is_absent() {
        let repo: InMemoryRepository<String> = InMemoryRepository::new();
        repo.insert_raw("blank".to_string(), Vec::new());
        assert!(repo.load(&"blank".to_string()).await.unwrap().is_none());

        let single = InMemorySingleRepository::with_document(Vec::new());
        assert!(single.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_round_trip() {
        let repo = InMemorySingleRepository::new();
        assert!(!repo.exists().await.unwrap());
        repo.save(b"{\"kits\":{}}").await.unwrap();
        assert_eq!(repo.raw().await.unwrap(), b"{\"kits\":{}}".to_vec());
        assert!(repo.delete().await.unwrap());
        assert!(!repo.exists().await.unwrap());
    }
}
