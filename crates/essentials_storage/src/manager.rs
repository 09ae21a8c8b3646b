//! # Storage Manager
//!
//! Owns one storage service per document kind plus the user cache, and wires
//! them to their repositories. Hosts create a single manager at startup and
//! pass it (or its services) to the features that need persistence.

use crate::config::StorageConfig;
use crate::documents::{general, kit, user, world, GeneralData, KitData, UserData, WorldData};
use crate::error::{StorageError, StorageResult};
use crate::object::Document;
use crate::repository::{
    FlatFileRepository, FlatFileSingleRepository, KeyedRepository, SingleRepository,
};
use crate::service::{ActiveEntities, EvictionOutcome, KeyedStorageService, PresenceReadmission};
use crate::single::SingleCachedService;
use crate::types::{PlayerId, WorldKey};
use crate::usercache::UserCacheService;
use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Repositories backing each document kind.
pub struct StorageBackends {
    pub users: Arc<dyn KeyedRepository<PlayerId>>,
    pub worlds: Arc<dyn KeyedRepository<WorldKey>>,
    pub general: Arc<dyn SingleRepository>,
    pub kits: Arc<dyn SingleRepository>,
}

impl StorageBackends {
    /// Flat JSON files under the configured data directory.
    pub fn flat_file(config: &StorageConfig) -> Self {
        let backup = config.backup_on_save;
        Self {
            users: Arc::new(FlatFileRepository::<PlayerId>::new(config.users_directory(), backup)),
            worlds: Arc::new(FlatFileRepository::<WorldKey>::new(config.worlds_directory(), backup)),
            general: Arc::new(FlatFileSingleRepository::new(config.general_file(), backup)),
            kits: Arc::new(FlatFileSingleRepository::new(config.kits_file(), backup)),
        }
    }
}

pub struct StorageManager {
    config: StorageConfig,
    users: Arc<KeyedStorageService<PlayerId, UserData>>,
    worlds: Arc<KeyedStorageService<WorldKey, WorldData>>,
    general: Arc<SingleCachedService<GeneralData>>,
    kits: Arc<SingleCachedService<KitData>>,
    user_cache: Arc<UserCacheService>,
    online: Arc<ActiveEntities<PlayerId>>,
}

impl StorageManager {
    /// Creates a manager over flat-file repositories and loads the user cache snapshot.
    pub async fn open(config: StorageConfig) -> StorageResult<Self> {
        tokio::fs::create_dir_all(&config.data_directory).await?;
        let backends = StorageBackends::flat_file(&config);
        let manager = Self::with_backends(config, backends);
        manager.user_cache.load().await;
        info!(
            "📂 Storage opened at {} ({} user documents cached in index)",
            manager.config.data_directory.display(),
            manager.user_cache.len().await
        );
        Ok(manager)
    }

    /// Creates a manager over explicit repositories. The user cache starts empty.
    pub fn with_backends(config: StorageConfig, backends: StorageBackends) -> Self {
        let online = Arc::new(ActiveEntities::<PlayerId>::new());

        let users = Arc::new(
            KeyedStorageService::new("users", Arc::new(user::translator()), backends.users)
                .with_readmission_check(Arc::new(PresenceReadmission::new(online.clone())))
                .with_max_concurrent_loads(config.max_concurrent_loads),
        );
        let worlds = Arc::new(
            KeyedStorageService::new("worlds", Arc::new(world::translator()), backends.worlds)
                .with_max_concurrent_loads(config.max_concurrent_loads),
        );
        let general = Arc::new(SingleCachedService::new(
            "general",
            Arc::new(general::translator()),
            backends.general,
        ));
        let kits = Arc::new(SingleCachedService::new("kits", Arc::new(kit::translator()), backends.kits));
        let user_cache = Arc::new(UserCacheService::new(
            users.clone(),
            config.user_cache_file(),
            config.rebuild_batch_size,
        ));

        Self {
            config,
            users,
            worlds,
            general,
            kits,
            user_cache,
            online,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn users(&self) -> &Arc<KeyedStorageService<PlayerId, UserData>> {
        &self.users
    }

    pub fn worlds(&self) -> &Arc<KeyedStorageService<WorldKey, WorldData>> {
        &self.worlds
    }

    pub fn general(&self) -> &Arc<SingleCachedService<GeneralData>> {
        &self.general
    }

    pub fn kits(&self) -> &Arc<SingleCachedService<KitData>> {
        &self.kits
    }

    pub fn user_cache(&self) -> &Arc<UserCacheService> {
        &self.user_cache
    }

    pub fn online_players(&self) -> &Arc<ActiveEntities<PlayerId>> {
        &self.online
    }

    /// Marks a player online and returns their (possibly new) document.
    ///
    /// Records the first join time for new players and the connecting address
    /// when one is known, then refreshes the player's user cache row.
    pub async fn player_connected(
        &self,
        id: PlayerId,
        address: Option<IpAddr>,
    ) -> StorageResult<Document<UserData>> {
        self.online.activate(id);
        let document = self.users.get_or_new(&id).await?;

        document.with(|doc| {
            if !doc.has(&user::FIRST_JOIN) {
                doc.set(&user::FIRST_JOIN, Utc::now());
            }
            if let Some(address) = address {
                doc.set(&user::LAST_IP, address.to_string());
            }
        });

        self.user_cache.update_for_player(id, &document).await;
        Ok(document)
    }

    /// Marks a player offline, refreshes their cache row and evicts their
    /// document (saving it first if dirty).
    pub async fn player_disconnected(&self, id: PlayerId) -> StorageResult<EvictionOutcome> {
        self.online.deactivate(&id);
        if let Some(document) = self.users.get_cached(&id) {
            self.user_cache.update_for_player(id, &document).await;
        }
        self.users.unpin(&id);
        self.users.evict(&id).await
    }

    /// Refreshes user cache rows for every online player.
    pub async fn refresh_online_user_cache(&self) -> StorageResult<usize> {
        self.user_cache.update_for_players(self.online.snapshot()).await
    }

    /// Evicts idle unpinned documents from the keyed services.
    pub async fn sweep_idle(&self) -> usize {
        let timeout = self.config.cache_idle_timeout;
        let (users, worlds) = tokio::join!(self.users.evict_idle(timeout), self.worlds.evict_idle(timeout));
        users + worlds
    }

    /// Saves every dirty document and the user cache snapshot.
    ///
    /// All stores are attempted even when one fails.
    pub async fn save_all(&self) -> StorageResult<()> {
        let (general, kits, users, worlds) = tokio::join!(
            self.general.ensure_saved(),
            self.kits.ensure_saved(),
            self.users.ensure_saved(),
            self.worlds.ensure_saved(),
        );
        let cache = self.user_cache.save().await;

        let failures: Vec<String> = [
            ("general", general.err()),
            ("kits", kits.err()),
            ("users", users.err()),
            ("worlds", worlds.err()),
            ("user cache", cache.err()),
        ]
        .into_iter()
        .filter_map(|(store, failure)| failure.map(|e| format!("{}: {}", store, e)))
        .collect();

        if failures.is_empty() {
            info!("💾 All storage saved");
            Ok(())
        } else {
            error!("❌ Storage save incomplete: {}", failures.join("; "));
            Err(StorageError::Save(failures.join("; ")))
        }
    }

    /// Saves everything, then empties every cache.
    pub async fn save_and_invalidate_all(&self) -> StorageResult<()> {
        let result = self.save_all().await;
        self.general.clear_cache().await;
        self.kits.clear_cache().await;
        self.users.clear_cache().await;
        self.worlds.clear_cache().await;
        result
    }
}
