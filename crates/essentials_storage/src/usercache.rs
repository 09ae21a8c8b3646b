//! # User Cache
//!
//! A small derived index over every user document, answering "who connected
//! from this address", "who is jailed" and "who is muted" without loading
//! every user file. The index is persisted as `usercache.json` and rebuilt by
//! walking the user repository when its format version changes or it is
//! empty.
//!
//! How jail and mute state is read from a user document is pluggable, so the
//! features owning that state can register their own extraction.

use crate::documents::user::{self, UserData};
use crate::error::StorageResult;
use crate::object::{Document, KeyedDataObject};
use crate::repository::write_document;
use crate::service::{KeyQuery, KeyedStorageService};
use crate::types::PlayerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Format version of the persisted snapshot. Bump to force a rebuild.
pub const USER_CACHE_VERSION: u32 = 1;

/// Reads the name of the jail a user is held in.
pub type JailProcessor = Arc<dyn Fn(&mut KeyedDataObject<UserData>) -> Option<String> + Send + Sync>;

/// Reads whether a user is muted.
pub type MuteProcessor = Arc<dyn Fn(&mut KeyedDataObject<UserData>) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCacheEntry {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub jail: Option<String>,
    #[serde(default)]
    pub muted: bool,
}

impl UserCacheEntry {
    pub fn is_jailed(&self) -> bool {
        self.jail.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserCacheSnapshot {
    /// 0 when the file predates versioning or does not exist.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub rebuilt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: HashMap<PlayerId, UserCacheEntry>,
}

impl UserCacheSnapshot {
    fn current(entries: HashMap<PlayerId, UserCacheEntry>) -> Self {
        Self {
            version: USER_CACHE_VERSION,
            rebuilt_at: Some(Utc::now()),
            entries,
        }
    }
}

struct Processors {
    jail: JailProcessor,
    mute: MuteProcessor,
}

/// Clears the walking flag when a rebuild ends, however it ends.
struct WalkGuard<'a>(&'a AtomicBool);

impl Drop for WalkGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct UserCacheService {
    users: Arc<KeyedStorageService<PlayerId, UserData>>,
    path: PathBuf,
    snapshot: RwLock<UserCacheSnapshot>,
    walking: AtomicBool,
    batch_size: usize,
    processors: StdRwLock<Processors>,
}

impl UserCacheService {
    /// Creates the service with an empty snapshot. Call [`load`](Self::load)
    /// to read the persisted one.
    pub fn new(
        users: Arc<KeyedStorageService<PlayerId, UserData>>,
        path: impl Into<PathBuf>,
        batch_size: usize,
    ) -> Self {
        Self {
            users,
            path: path.into(),
            snapshot: RwLock::new(UserCacheSnapshot::default()),
            walking: AtomicBool::new(false),
            batch_size: batch_size.max(1),
            processors: StdRwLock::new(Processors {
                jail: Arc::new(|doc: &mut KeyedDataObject<UserData>| doc.get(&user::JAIL)),
                mute: Arc::new(|doc: &mut KeyedDataObject<UserData>| {
                    doc.get_or_default(&user::MUTED).unwrap_or(false)
                }),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_jail_processor(&self, processor: JailProcessor) {
        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .jail = processor;
    }

    pub fn set_mute_processor(&self, processor: MuteProcessor) {
        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .mute = processor;
    }

    /// Reads the persisted snapshot. A missing or unreadable file yields an
    /// empty, unversioned snapshot, which makes the next
    /// [`start_rebuild_if_needed`](Self::start_rebuild_if_needed) rebuild.
    pub async fn load(&self) {
        let snapshot = match fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<UserCacheSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("❌ Unreadable user cache {}: {}", self.path.display(), e);
                    UserCacheSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => UserCacheSnapshot::default(),
            Err(e) => {
                error!("❌ Failed to read user cache {}: {}", self.path.display(), e);
                UserCacheSnapshot::default()
            }
        };
        debug!("Loaded user cache with {} entries (v{})", snapshot.entries.len(), snapshot.version);
        *self.snapshot.write().await = snapshot;
    }

    pub async fn save(&self) -> StorageResult<()> {
        let bytes = {
            let snapshot = self.snapshot.read().await;
            serde_json::to_vec_pretty(&*snapshot)?
        };
        write_document(&self.path, &bytes, false).await
    }

    pub async fn is_correct_version(&self) -> bool {
        self.snapshot.read().await.version == USER_CACHE_VERSION
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot.read().await.entries.is_empty()
    }

    pub async fn entry(&self, id: &PlayerId) -> Option<UserCacheEntry> {
        self.snapshot.read().await.entries.get(id).cloned()
    }

    /// Players last seen at `ip`. A leading `/` (socket address notation) is ignored.
    pub async fn get_for_ip(&self, ip: &str) -> Vec<PlayerId> {
        let wanted = ip.replace('/', "");
        self.matching(|entry| entry.ip_address.as_deref() == Some(wanted.as_str()))
            .await
    }

    pub async fn get_jailed(&self) -> Vec<PlayerId> {
        self.matching(UserCacheEntry::is_jailed).await
    }

    /// Players held in the named jail, compared case-insensitively.
    pub async fn get_jailed_in(&self, jail: &str) -> Vec<PlayerId> {
        self.matching(|entry| {
            entry
                .jail
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(jail))
        })
        .await
    }

    pub async fn get_muted(&self) -> Vec<PlayerId> {
        self.matching(|entry| entry.muted).await
    }

    /// Refreshes one player's row from their document.
    pub async fn update_for_player(&self, id: PlayerId, document: &Document<UserData>) {
        let entry = self.extract(document);
        self.snapshot.write().await.entries.insert(id, entry);
    }

    /// Refreshes one player's row, loading their document if needed.
    /// A document loaded here is left unpinned.
    pub async fn update_for_player_id(&self, id: PlayerId) -> StorageResult<bool> {
        match self.users.get_unpinned(&id).await? {
            Some(document) => {
                self.update_for_player(id, &document).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refreshes the rows of every listed player (normally the online ones).
    pub async fn update_for_players(&self, ids: impl IntoIterator<Item = PlayerId>) -> StorageResult<usize> {
        let documents = self.users.get_all(KeyQuery::keys(ids)).await?;
        let entries: Vec<(PlayerId, UserCacheEntry)> = documents
            .iter()
            .map(|(id, document)| (*id, self.extract(document)))
            .collect();

        let updated = entries.len();
        self.snapshot.write().await.entries.extend(entries);
        Ok(updated)
    }

    /// Rebuilds when the snapshot has the wrong version or no entries.
    /// Returns whether a rebuild ran.
    pub async fn start_rebuild_if_needed(&self) -> StorageResult<bool> {
        if self.walking.load(Ordering::Acquire) {
            return Ok(false);
        }
        let needed = {
            let snapshot = self.snapshot.read().await;
            snapshot.version != USER_CACHE_VERSION || snapshot.entries.is_empty()
        };
        if !needed {
            return Ok(false);
        }
        self.rebuild().await
    }

    /// Walks every stored user document and replaces the snapshot.
    ///
    /// Returns `Ok(false)` without doing anything when a rebuild is already
    /// running. Documents are loaded in batches; after each batch the bulk
    /// loaded documents are trimmed from the user cache again so the walk
    /// never holds more than one batch of extra documents in memory.
    pub async fn rebuild(&self) -> StorageResult<bool> {
        if self
            .walking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("User cache rebuild already in progress");
            return Ok(false);
        }
        let _guard = WalkGuard(&self.walking);

        info!("🔄 Rebuilding user cache from {}", self.users.name());
        let keys = self.users.all_keys().await?;
        let mut entries = HashMap::with_capacity(keys.len());

        for batch in keys.chunks(self.batch_size) {
            let documents = self.users.get_all(KeyQuery::keys(batch.iter().copied())).await?;
            for (id, document) in &documents {
                entries.insert(*id, self.extract(document));
            }
            drop(documents);
            let trimmed = self.users.clear_unpinned();
            debug!("User cache batch of {} done, trimmed {} document(s)", batch.len(), trimmed);
        }

        let skipped = keys.len() - entries.len();
        if skipped > 0 {
            warn!("⚠️ {} user document(s) could not be read during rebuild", skipped);
        }

        let count = entries.len();
        *self.snapshot.write().await = UserCacheSnapshot::current(entries);
        self.save().await?;
        info!("✅ User cache rebuilt with {} entries", count);
        Ok(true)
    }

    pub fn is_rebuilding(&self) -> bool {
        self.walking.load(Ordering::Acquire)
    }

    async fn matching(&self, predicate: impl Fn(&UserCacheEntry) -> bool) -> Vec<PlayerId> {
        self.snapshot
            .read()
            .await
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| *id)
            .collect()
    }

    fn extract(&self, document: &Document<UserData>) -> UserCacheEntry {
        let (jail, mute) = {
            let processors = self.processors.read().unwrap_or_else(PoisonError::into_inner);
            (Arc::clone(&processors.jail), Arc::clone(&processors.mute))
        };
        document.with(|doc| UserCacheEntry {
            ip_address: doc.get(&user::LAST_IP).map(|ip| ip.replace('/', "")),
            jail: jail(&mut *doc),
            muted: mute(&mut *doc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::user;
    use crate::repository::InMemoryRepository;
    use tempfile::TempDir;

    fn users() -> (Arc<InMemoryRepository<PlayerId>>, Arc<KeyedStorageService<PlayerId, UserData>>) {
        let repo = Arc::new(InMemoryRepository::<PlayerId>::new());
        let svc = Arc::new(KeyedStorageService::new(
            "users",
            Arc::new(user::translator()),
            repo.clone() as Arc<dyn crate::repository::KeyedRepository<PlayerId>>,
        ));
        (repo, svc)
    }

    async fn store_user(svc: &KeyedStorageService<PlayerId, UserData>, ip: &str, jail: Option<&str>, muted: bool) -> PlayerId {
        let id = PlayerId::new();
        let doc = svc.get_or_new(&id).await.unwrap();
        doc.set(&user::LAST_IP, ip.to_string());
        if let Some(jail) = jail {
            doc.set(&user::JAIL, jail.to_string());
        }
        doc.set(&user::MUTED, muted);
        svc.save(&id, &doc).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_rebuild_and_queries() {
        let dir = TempDir::new().unwrap();
        let (_repo, svc) = users();
        let a = store_user(&svc, "/10.0.0.1", Some("Alcatraz"), false).await;
        let b = store_user(&svc, "10.0.0.1", None, true).await;
        let c = store_user(&svc, "10.0.0.2", None, false).await;
        svc.clear_cache().await;

        let cache = UserCacheService::new(svc.clone(), dir.path().join("usercache.json"), 2);
        assert!(cache.start_rebuild_if_needed().await.unwrap());
        assert_eq!(cache.len().await, 3);
        assert!(cache.is_correct_version().await);
        assert_eq!(svc.cached_len(), 0);

        let mut same_ip = cache.get_for_ip("/10.0.0.1").await;
        same_ip.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(same_ip, expected);
        assert_eq!(cache.get_jailed().await, vec![a]);
        assert_eq!(cache.get_jailed_in("alcatraz").await, vec![a]);
        assert!(cache.get_jailed_in("elsewhere").await.is_empty());
        assert_eq!(cache.get_muted().await, vec![b]);
        assert_eq!(cache.get_for_ip("10.0.0.2").await, vec![c]);

        // Populated and current: nothing to do.
        assert!(!cache.start_rebuild_if_needed().await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_persists() {
        let dir = TempDir::new().unwrap();
        let (_repo, svc) = users();
        let id = store_user(&svc, "1.2.3.4", None, true).await;
        let path = dir.path().join("usercache.json");

        let cache = UserCacheService::new(svc.clone(), &path, 10);
        assert!(cache.rebuild().await.unwrap());
        // written through a temporary file that is renamed into place
        assert!(!dir.path().join("usercache.json.tmp").exists());
        let stored: UserCacheSnapshot = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored.version, USER_CACHE_VERSION);

        let reopened = UserCacheService::new(svc, &path, 10);
        reopened.load().await;
        assert!(reopened.is_correct_version().await);
        assert_eq!(reopened.entry(&id).await.unwrap().ip_address.as_deref(), Some("1.2.3.4"));
    }

    #[tokio::test]
    async fn test_wrong_version_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usercache.json");
        let stale = UserCacheSnapshot {
            version: 0,
            rebuilt_at: None,
            entries: HashMap::from([(PlayerId::new(), UserCacheEntry::default())]),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let (_repo, svc) = users();
        let cache = UserCacheService::new(svc, &path, 10);
        cache.load().await;
        assert!(!cache.is_correct_version().await);
        assert!(cache.start_rebuild_if_needed().await.unwrap());
        assert!(cache.is_empty().await);
        assert!(cache.is_correct_version().await);
    }

    #[tokio::test]
    async fn test_rebuild_refuses_while_walking() {
        let dir = TempDir::new().unwrap();
        let (_repo, svc) = users();
        let cache = UserCacheService::new(svc, dir.path().join("usercache.json"), 10);

        cache.walking.store(true, Ordering::Release);
        assert!(!cache.rebuild().await.unwrap());
        assert!(!cache.start_rebuild_if_needed().await.unwrap());

        cache.walking.store(false, Ordering::Release);
        assert!(cache.rebuild().await.unwrap());
        assert!(!cache.is_rebuilding());
    }

    #[tokio::test]
    async fn test_custom_processors_and_online_update() {
        let dir = TempDir::new().unwrap();
        let (_repo, svc) = users();
        let id = store_user(&svc, "5.5.5.5", None, false).await;

        let cache = UserCacheService::new(svc.clone(), dir.path().join("usercache.json"), 10);
        cache.set_jail_processor(Arc::new(|_: &mut KeyedDataObject<UserData>| Some("everyone".to_string())));
        cache.set_mute_processor(Arc::new(|_: &mut KeyedDataObject<UserData>| true));

        assert_eq!(cache.update_for_players([id]).await.unwrap(), 1);
        let entry = cache.entry(&id).await.unwrap();
        assert_eq!(entry.jail.as_deref(), Some("everyone"));
        assert!(entry.muted);

        assert!(!cache.update_for_player_id(PlayerId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_refresh_leaves_document_evictable() {
        let dir = TempDir::new().unwrap();
        let (_repo, svc) = users();
        let id = store_user(&svc, "9.9.9.9", Some("alcatraz"), false).await;
        svc.clear_cache().await;

        let cache = UserCacheService::new(svc.clone(), dir.path().join("usercache.json"), 10);
        assert!(cache.update_for_player_id(id).await.unwrap());
        assert_eq!(cache.entry(&id).await.unwrap().jail.as_deref(), Some("alcatraz"));
        assert_eq!(svc.entry_state(&id), Some(crate::service::EntryState::Unpinned));

        assert_eq!(svc.evict_idle(std::time::Duration::ZERO).await, 1);
        assert!(!svc.is_cached(&id));
    }
}
