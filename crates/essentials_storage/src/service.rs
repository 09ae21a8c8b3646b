//! # Keyed Storage Service
//!
//! Cache-aside access to keyed documents (one per player, one per world).
//!
//! ## Cache Lifecycle
//!
//! Every cached document sits in exactly one [`EntryState`]:
//!
//! ```text
//!            get / get_or_new / save
//!   (absent) ───────────────────────▶ Pinned ◀──────────────┐
//!      ▲                               │  unpin              │ readmitted, or
//!      │ get_all (bulk)                ▼                     │ get() during eviction
//!      └──────────────────────────▶ Unpinned ── evict ──▶ Evicting
//!                                                            │
//!                                      dirty? save first     │
//!   (absent) ◀───────────────────────────────────────────────┘ dropped
//! ```
//!
//! Pinned entries are never evicted by the idle sweep. Bulk loads arrive
//! unpinned so a large scan can be trimmed with [`KeyedStorageService::clear_unpinned`]
//! without dropping documents that live players are holding.
//!
//! An eviction first asks the optional [`ReadmissionCheck`] whether the
//! document is still wanted (for example because the player is online). A
//! readmitted document is re-pinned and the very same instance keeps being
//! served, so no reference held elsewhere goes stale.
//!
//! A dirty document is saved before it is dropped. If that save fails the
//! entry stays cached and the error is returned.

use crate::error::{StorageError, StorageResult};
use crate::key::{DataKey, DataValue, DocumentKind};
use crate::object::{Document, KeyedDataObject};
use crate::repository::{KeyedRepository, StorageKey};
use crate::translator::DataTranslator;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Requested by a caller; survives idle sweeps.
    Pinned,
    /// Loaded in bulk or released; eligible for eviction.
    Unpinned,
    /// Eviction in progress.
    Evicting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Removed from the cache (saved first if dirty).
    Dropped,
    /// Kept: the re-admission check or a concurrent `get` claimed it.
    Readmitted,
    /// Nothing cached for the key.
    NotCached,
    /// Another eviction of the same key is running.
    AlreadyEvicting,
    /// A different instance replaced the entry while evicting.
    Superseded,
}

/// Selects documents for bulk operations.
#[derive(Debug, Clone)]
pub enum KeyQuery<K> {
    All,
    Keys(HashSet<K>),
}

impl<K: StorageKey> KeyQuery<K> {
    pub fn all() -> Self {
        KeyQuery::All
    }

    pub fn keys(keys: impl IntoIterator<Item = K>) -> Self {
        KeyQuery::Keys(keys.into_iter().collect())
    }
}

/// Vote passed to a [`ReadmissionCheck`]. Calling [`readmit`](Self::readmit)
/// keeps the document cached.
#[derive(Debug, Default)]
pub struct Readmission {
    requested: AtomicBool,
}

impl Readmission {
    pub fn readmit(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Decides whether a document about to be evicted must stay cached.
pub trait ReadmissionCheck<K, O: DocumentKind>: Send + Sync {
    fn check(&self, key: &K, document: &Document<O>, readmission: &Readmission);
}

/// Set of entities currently present (online players, loaded worlds).
pub struct ActiveEntities<K: StorageKey> {
    active: DashSet<K>,
}

impl<K: StorageKey> ActiveEntities<K> {
    pub fn new() -> Self {
        Self {
            active: DashSet::new(),
        }
    }

    pub fn activate(&self, key: K) -> bool {
        self.active.insert(key)
    }

    pub fn deactivate(&self, key: &K) -> bool {
        self.active.remove(key).is_some()
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.active.contains(key)
    }

    pub fn snapshot(&self) -> Vec<K> {
        self.active.iter().map(|key| key.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl<K: StorageKey> Default for ActiveEntities<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Readmits documents whose key is still active.
pub struct PresenceReadmission<K: StorageKey> {
    presence: Arc<ActiveEntities<K>>,
}

impl<K: StorageKey> PresenceReadmission<K> {
    pub fn new(presence: Arc<ActiveEntities<K>>) -> Self {
        Self { presence }
    }
}

impl<K: StorageKey, O: DocumentKind> ReadmissionCheck<K, O> for PresenceReadmission<K> {
    fn check(&self, key: &K, _document: &Document<O>, readmission: &Readmission) {
        if self.presence.is_active(key) {
            debug!("♻️ Readmitting {} document for active {}", O::NAME, key);
            readmission.readmit();
        }
    }
}

struct CacheEntry<O> {
    document: Document<O>,
    state: EntryState,
    last_access: Instant,
}

pub struct KeyedStorageService<K: StorageKey, O: DocumentKind> {
    name: String,
    translator: Arc<DataTranslator<O>>,
    repository: Arc<dyn KeyedRepository<K>>,
    cache: DashMap<K, CacheEntry<O>>,
    readmission: Option<Arc<dyn ReadmissionCheck<K, O>>>,
    max_concurrent_loads: usize,
}

impl<K: StorageKey, O: DocumentKind> KeyedStorageService<K, O> {
    pub fn new(
        name: impl Into<String>,
        translator: Arc<DataTranslator<O>>,
        repository: Arc<dyn KeyedRepository<K>>,
    ) -> Self {
        Self {
            name: name.into(),
            translator,
            repository,
            cache: DashMap::new(),
            readmission: None,
            max_concurrent_loads: num_cpus::get().max(1),
        }
    }

    pub fn with_readmission_check(mut self, check: Arc<dyn ReadmissionCheck<K, O>>) -> Self {
        self.readmission = Some(check);
        self
    }

    /// Caps how many documents a bulk load reads at once.
    pub fn with_max_concurrent_loads(mut self, limit: usize) -> Self {
        self.max_concurrent_loads = limit.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn translator(&self) -> &DataTranslator<O> {
        &self.translator
    }

    /// Creates an empty document at the current content version. Not cached.
    pub fn create_new(&self) -> KeyedDataObject<O> {
        self.translator.create_new()
    }

    /// Returns the cached document for `key`, loading it on a miss.
    ///
    /// `Ok(None)` when the repository has no document. Load failures are
    /// returned; nothing is cached for the key in that case.
    pub async fn get(&self, key: &K) -> StorageResult<Option<Document<O>>> {
        self.fetch(key, EntryState::Pinned).await
    }

    /// Like [`get`](Self::get), but a newly loaded document is cached
    /// unpinned so idle eviction can reclaim it. An existing entry keeps
    /// its state.
    pub async fn get_unpinned(&self, key: &K) -> StorageResult<Option<Document<O>>> {
        self.fetch(key, EntryState::Unpinned).await
    }

    /// Like [`get`](Self::get), but caches a fresh document when none exists.
    /// The fresh document is not persisted until saved.
    pub async fn get_or_new(&self, key: &K) -> StorageResult<Document<O>> {
        if let Some(document) = self.get(key).await? {
            return Ok(document);
        }
        debug!("🆕 Creating new {} document for {}", O::NAME, key);
        Ok(self.admit(key.clone(), self.create_new(), EntryState::Pinned))
    }

    /// Returns the cached document without touching the repository.
    pub fn get_cached(&self, key: &K) -> Option<Document<O>> {
        self.cache.get(key).map(|entry| entry.document.clone())
    }

    /// Whether a stored document exists. Cached documents that were never
    /// saved do not count.
    pub async fn exists(&self, key: &K) -> StorageResult<bool> {
        self.repository.exists(key).await
    }

    /// Persists `document` and makes it the cached instance for `key`.
    pub async fn save(&self, key: &K, document: &Document<O>) -> StorageResult<()> {
        self.persist(key, document).await?;
        match self.cache.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !Document::ptr_eq(&entry.document, document) {
                    entry.document = document.clone();
                }
                entry.last_access = Instant::now();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    document: document.clone(),
                    state: EntryState::Pinned,
                    last_access: Instant::now(),
                });
            }
        }
        Ok(())
    }

    /// Loads (or creates) the document, applies `value` and saves.
    pub async fn set_and_save<V: DataValue>(
        &self,
        key: &K,
        data_key: &DataKey<V, O>,
        value: V,
    ) -> StorageResult<()> {
        let document = self.get_or_new(key).await?;
        document.set(data_key, value);
        self.save(key, &document).await
    }

    pub async fn remove_and_save<V: DataValue>(
        &self,
        key: &K,
        data_key: &DataKey<V, O>,
    ) -> StorageResult<()> {
        let document = self.get_or_new(key).await?;
        document.remove(data_key);
        self.save(key, &document).await
    }

    /// Deletes the stored document and drops it from the cache without saving.
    pub async fn delete(&self, key: &K) -> StorageResult<bool> {
        if let Some((_, entry)) = self.cache.remove(key) {
            entry.document.mark_dirty(false);
        }
        let existed = self.repository.delete(key).await?;
        info!("🗑️ {}: deleted {} document for {}", self.name, O::NAME, key);
        Ok(existed)
    }

    /// Loads every document matched by `query`.
    ///
    /// Keys without a stored document and documents that fail to load are
    /// left out of the result. Newly loaded documents are cached unpinned.
    pub async fn get_all(&self, query: KeyQuery<K>) -> StorageResult<HashMap<K, Document<O>>> {
        let keys: Vec<K> = match query {
            KeyQuery::All => self.repository.keys().await?,
            KeyQuery::Keys(keys) => keys.into_iter().collect(),
        };

        let results: Vec<(K, StorageResult<Option<Document<O>>>)> = stream::iter(keys)
            .map(|key| async move {
                let result = self.fetch(&key, EntryState::Unpinned).await;
                (key, result)
            })
            .buffer_unordered(self.max_concurrent_loads)
            .collect()
            .await;

        let mut documents = HashMap::with_capacity(results.len());
        for (key, result) in results {
            match result {
                Ok(Some(document)) => {
                    documents.insert(key, document);
                }
                Ok(None) => {}
                Err(e) => warn!("⚠️ {}: skipping {} in bulk load: {}", self.name, key, e),
            }
        }
        Ok(documents)
    }

    /// Every key with a stored document.
    pub async fn all_keys(&self) -> StorageResult<Vec<K>> {
        self.repository.keys().await
    }

    pub async fn count(&self, query: KeyQuery<K>) -> StorageResult<usize> {
        match query {
            KeyQuery::All => self.repository.count().await,
            KeyQuery::Keys(keys) => {
                let mut count = 0;
                for key in &keys {
                    if self.exists(key).await? {
                        count += 1;
                    }
                }
                Ok(count)
            }
        }
    }

    /// Saves every cached dirty document. Returns how many were saved.
    ///
    /// Every dirty document is attempted; if any save fails the last failure
    /// is returned after the rest have been tried.
    pub async fn ensure_saved(&self) -> StorageResult<usize> {
        let dirty: Vec<(K, Document<O>)> = self
            .snapshot()
            .into_iter()
            .filter(|(_, document)| document.is_dirty())
            .collect();

        let mut saved = 0;
        let mut failure = None;
        for (key, document) in dirty {
            match self.persist(&key, &document).await {
                Ok(()) => saved += 1,
                Err(e) => failure = Some(e),
            }
        }

        if saved > 0 {
            info!("💾 {}: saved {} dirty {} document(s)", self.name, saved, O::NAME);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    /// Releases a caller's hold on `key`, making it eligible for eviction.
    pub fn unpin(&self, key: &K) -> bool {
        match self.cache.get_mut(key) {
            Some(mut entry) if entry.state == EntryState::Pinned => {
                entry.state = EntryState::Unpinned;
                true
            }
            _ => false,
        }
    }

    pub fn entry_state(&self, key: &K) -> Option<EntryState> {
        self.cache.get(key).map(|entry| entry.state)
    }

    pub fn is_cached(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cached_keys(&self) -> Vec<K> {
        self.cache.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Evicts `key`, consulting the re-admission check and saving dirty state first.
    pub async fn evict(&self, key: &K) -> StorageResult<EvictionOutcome> {
        let document = {
            let Some(mut entry) = self.cache.get_mut(key) else {
                return Ok(EvictionOutcome::NotCached);
            };
            if entry.state == EntryState::Evicting {
                return Ok(EvictionOutcome::AlreadyEvicting);
            }
            entry.state = EntryState::Evicting;
            entry.document.clone()
        };
        // Hands the entry back as unpinned if this eviction does not finish,
        // including when the future is dropped mid-save.
        let _reset = EvictingGuard {
            cache: &self.cache,
            key,
            document: &document,
        };

        let readmission = Readmission::default();
        if let Some(check) = &self.readmission {
            check.check(key, &document, &readmission);
        }
        if readmission.is_requested() {
            return Ok(self.repin(key, &document));
        }

        if document.is_dirty() {
            if let Err(e) = self.persist(key, &document).await {
                error!("❌ {}: keeping {} cached, save before eviction failed: {}", self.name, key, e);
                return Err(e);
            }
        }

        let removed = self.cache.remove_if(key, |_, entry| {
            entry.state == EntryState::Evicting && Document::ptr_eq(&entry.document, &document)
        });
        if removed.is_some() {
            debug!("📤 {}: evicted {}", self.name, key);
            return Ok(EvictionOutcome::Dropped);
        }

        let outcome = match self.cache.get(key) {
            Some(entry) if Document::ptr_eq(&entry.document, &document) => EvictionOutcome::Readmitted,
            Some(_) => EvictionOutcome::Superseded,
            None => EvictionOutcome::Dropped,
        };
        Ok(outcome)
    }

    /// Evicts every unpinned entry idle for at least `max_idle`.
    /// Returns how many entries were dropped.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let candidates: Vec<K> = self
            .cache
            .iter()
            .filter(|entry| entry.state == EntryState::Unpinned && entry.last_access.elapsed() >= max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut dropped = 0;
        for key in candidates {
            match self.evict(&key).await {
                Ok(EvictionOutcome::Dropped) => dropped += 1,
                Ok(_) => {}
                Err(e) => warn!("⚠️ {}: idle eviction of {} failed: {}", self.name, key, e),
            }
        }
        if dropped > 0 {
            debug!("🧹 {}: evicted {} idle document(s)", self.name, dropped);
        }
        dropped
    }

    /// Drops unpinned entries that have no unsaved changes.
    pub fn clear_unpinned(&self) -> usize {
        let candidates: Vec<(K, Document<O>)> = self
            .cache
            .iter()
            .filter(|entry| entry.state == EntryState::Unpinned)
            .map(|entry| (entry.key().clone(), entry.document.clone()))
            .collect();

        let mut cleared = 0;
        for (key, document) in candidates {
            if document.is_dirty() {
                continue;
            }
            let removed = self.cache.remove_if(&key, |_, entry| {
                entry.state == EntryState::Unpinned && Document::ptr_eq(&entry.document, &document)
            });
            if removed.is_some() {
                cleared += 1;
            }
        }
        cleared
    }

    /// Empties the cache without saving anything.
    pub async fn clear_cache(&self) {
        let count = self.cache.len();
        self.cache.clear();
        self.repository.clear_cache().await;
        info!("🧹 {}: cleared {} cached document(s)", self.name, count);
    }

    /// Empties the cache except for `keep`, without saving anything.
    pub fn clear_cache_unless(&self, keep: &HashSet<K>) {
        self.cache.retain(|key, _| keep.contains(key));
    }

    async fn fetch(&self, key: &K, state: EntryState) -> StorageResult<Option<Document<O>>> {
        if let Some(document) = self.touch(key, state) {
            return Ok(Some(document));
        }
        match self.load_object(key).await? {
            Some(object) => Ok(Some(self.admit(key.clone(), object, state))),
            None => Ok(None),
        }
    }

    /// Refreshes a cached entry. A pinning access also cancels a running eviction.
    fn touch(&self, key: &K, state: EntryState) -> Option<Document<O>> {
        let mut entry = self.cache.get_mut(key)?;
        entry.last_access = Instant::now();
        if state == EntryState::Pinned {
            entry.state = EntryState::Pinned;
        }
        Some(entry.document.clone())
    }

    /// Caches a freshly loaded object. If another task cached `key` first, its
    /// instance wins and is returned instead.
    fn admit(&self, key: K, object: KeyedDataObject<O>, state: EntryState) -> Document<O> {
        match self.cache.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_access = Instant::now();
                if state == EntryState::Pinned {
                    entry.state = EntryState::Pinned;
                }
                entry.document.clone()
            }
            Entry::Vacant(vacant) => {
                let document = Document::new(object);
                vacant.insert(CacheEntry {
                    document: document.clone(),
                    state,
                    last_access: Instant::now(),
                });
                document
            }
        }
    }

    fn repin(&self, key: &K, document: &Document<O>) -> EvictionOutcome {
        match self.cache.get_mut(key) {
            Some(mut entry) if Document::ptr_eq(&entry.document, document) => {
                entry.state = EntryState::Pinned;
                entry.last_access = Instant::now();
                EvictionOutcome::Readmitted
            }
            Some(_) => EvictionOutcome::Superseded,
            None => EvictionOutcome::NotCached,
        }
    }

    async fn load_object(&self, key: &K) -> StorageResult<Option<KeyedDataObject<O>>> {
        let Some(bytes) = self.repository.load(key).await? else {
            return Ok(None);
        };

        let translator = Arc::clone(&self.translator);
        let translated = tokio::task::spawn_blocking(move || translator.from_external(&bytes))
            .await
            .map_err(|e| StorageError::Load(format!("translation task failed: {}", e)))?;

        match translated {
            Ok(object) => {
                debug!("📥 {}: loaded {}", self.name, key);
                Ok(Some(object))
            }
            Err(e) => {
                error!("❌ {}: failed to load {} document for {}: {}", self.name, O::NAME, key, e);
                Err(e)
            }
        }
    }

    /// Serializes and writes `document`, clearing its dirty flag unless it
    /// was modified while the write was in flight.
    async fn persist(&self, key: &K, document: &Document<O>) -> StorageResult<()> {
        let (bytes, revision) = {
            let guard = document.lock();
            (self.translator.to_external(&guard)?, guard.revision())
        };

        if let Err(e) = self.repository.save(key, &bytes).await {
            error!("❌ {}: failed to save {} document for {}: {}", self.name, O::NAME, key, e);
            return Err(e);
        }

        document.with(|object| {
            if object.revision() == revision {
                object.mark_dirty(false);
            }
        });
        Ok(())
    }

    fn snapshot(&self) -> Vec<(K, Document<O>)> {
        self.cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.document.clone()))
            .collect()
    }
}

/// Resets an entry still marked [`EntryState::Evicting`] to unpinned on drop.
struct EvictingGuard<'a, K: StorageKey, O: DocumentKind> {
    cache: &'a DashMap<K, CacheEntry<O>>,
    key: &'a K,
    document: &'a Document<O>,
}

impl<'a, K: StorageKey, O: DocumentKind> Drop for EvictingGuard<'a, K, O> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.cache.get_mut(self.key) {
            if entry.state == EntryState::Evicting && Document::ptr_eq(&entry.document, self.document) {
                entry.state = EntryState::Unpinned;
            }
        }
    }
}
