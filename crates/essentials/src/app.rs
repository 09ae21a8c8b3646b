//! Main application logic and lifecycle management.
//!
//! The `Application` owns the single `StorageManager` for the process, runs
//! background maintenance while the host is up and flushes every cache when
//! a shutdown signal arrives.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    signals::{setup_signal_handlers, setup_signal_handlers_silent},
};
use essentials_storage::StorageManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
    /// Storage shared with every feature of the host
    storage: Arc<StorageManager>,
    /// Rebuild the user cache at startup regardless of its state
    force_rebuild: bool,
}

impl Application {
    /// Creates a new application instance.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments
    ///
    /// # Returns
    ///
    /// A configured `Application` instance ready to run, or an error if
    /// initialization failed.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply command-line argument overrides
    /// 3. Validate merged configuration
    /// 4. Open storage under the configured data directory
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(data_dir) = args.data_dir {
            config.storage.data_directory = data_dir.to_string_lossy().to_string();
        }

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        if args.json_logs {
            config.logging.json_format = true;
        }

        display_banner();
        Self::with_config(config, args.rebuild_user_cache).await
    }

    /// Validates `config` and opens storage with it.
    pub async fn with_config(
        config: AppConfig,
        force_rebuild: bool,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        let storage = Arc::new(StorageManager::open(config.to_storage_config()).await?);

        Ok(Self {
            config,
            storage,
            force_rebuild,
        })
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// Runs until a shutdown signal arrives, then saves and empties every cache.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Essentials storage host");
        self.log_configuration_summary();

        let rebuild_handle = self.spawn_user_cache_rebuild();
        let sweeper_handle = self.spawn_idle_sweeper();

        info!("✅ Essentials storage is ready");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        setup_signal_handlers().await?;

        // merciless shutdown
        tokio::spawn(async move {
            if let Err(e) = setup_signal_handlers_silent().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }

            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        if let Some(handle) = sweeper_handle {
            handle.abort();
        }
        rebuild_handle.abort();

        self.shutdown().await
    }

    /// Starts the user cache rebuild in the background.
    ///
    /// A forced rebuild always walks every user document; otherwise the walk
    /// only happens when the stored snapshot is outdated or empty and
    /// `rebuild_on_startup` is enabled.
    pub fn spawn_user_cache_rebuild(&self) -> JoinHandle<bool> {
        let user_cache = self.storage.user_cache().clone();
        let force = self.force_rebuild;
        let on_startup = self.config.user_cache.rebuild_on_startup;

        tokio::spawn(async move {
            let result = if force {
                user_cache.rebuild().await
            } else if on_startup {
                user_cache.start_rebuild_if_needed().await
            } else {
                Ok(false)
            };

            match result {
                Ok(ran) => ran,
                Err(e) => {
                    error!("❌ User cache rebuild failed: {}", e);
                    false
                }
            }
        })
    }

    /// Starts the periodic idle-document sweep, or returns `None` when the
    /// sweep interval is 0.
    pub fn spawn_idle_sweeper(&self) -> Option<JoinHandle<()>> {
        let seconds = self.config.storage.sweep_interval_seconds;
        if seconds == 0 {
            info!("🧹 Idle cache sweep disabled");
            return None;
        }

        let storage = self.storage.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(seconds));
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;
                let evicted = storage.sweep_idle().await;
                if evicted > 0 {
                    info!("🧹 Evicted {} idle document(s)", evicted);
                }
                if let Err(e) = storage.refresh_online_user_cache().await {
                    warn!("⚠️ Failed to refresh user cache for online players: {}", e);
                }
            }
        }))
    }

    /// Saves every dirty document plus the user cache, then empties all caches.
    pub async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("💾 Saving all cached documents...");
        match self.storage.save_and_invalidate_all().await {
            Ok(()) => {
                info!("✅ Essentials storage shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("❌ Some documents could not be saved during shutdown: {}", e);
                Err(e.into())
            }
        }
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  📂 Data directory: {}", self.config.storage.data_directory);
        info!(
            "  ⏱️ Idle timeout: {}s | Sweep every {}s",
            self.config.storage.cache_idle_seconds, self.config.storage.sweep_interval_seconds
        );
        info!("  🗂️ Backups on save: {}", self.config.storage.backup_on_save);
        info!(
            "  👥 User cache batch: {} | Concurrent loads: {}",
            self.config.user_cache.rebuild_batch_size, self.config.user_cache.max_concurrent_loads
        );
        info!("  📝 Log level: {}", self.config.logging.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use essentials_storage::documents::user;
    use essentials_storage::PlayerId;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.data_directory = dir.path().join("data").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.user_cache.rebuild_batch_size = 0;

        let result = Application::with_config(config, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_startup_rebuild_indexes_existing_users() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let id = PlayerId::new();

        {
            let app = Application::with_config(config.clone(), false).await.unwrap();
            app.storage()
                .users()
                .set_and_save(&id, &user::JAIL, "alcatraz".to_string())
                .await
                .unwrap();
        }

        let app = Application::with_config(config, false).await.unwrap();
        assert!(app.spawn_user_cache_rebuild().await.unwrap());
        assert_eq!(app.storage().user_cache().get_jailed().await, vec![id]);

        // A current, non-empty snapshot is not rebuilt again.
        assert!(!app.spawn_user_cache_rebuild().await.unwrap());
    }

    #[tokio::test]
    async fn test_rebuild_respects_startup_flag() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.user_cache.rebuild_on_startup = false;

        let app = Application::with_config(config.clone(), false).await.unwrap();
        assert!(!app.spawn_user_cache_rebuild().await.unwrap());

        let forced = Application::with_config(config, true).await.unwrap();
        assert!(forced.spawn_user_cache_rebuild().await.unwrap());
    }

    #[tokio::test]
    async fn test_sweeper_disabled_with_zero_interval() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.storage.sweep_interval_seconds = 0;

        let app = Application::with_config(config, false).await.unwrap();
        assert!(app.spawn_idle_sweeper().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_persists_connected_players() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let id = PlayerId::new();

        let app = Application::with_config(config.clone(), false).await.unwrap();
        let doc = app.storage().player_connected(id, None).await.unwrap();
        doc.set(&user::NICKNAME, "Steve".to_string());
        app.shutdown().await.unwrap();
        assert_eq!(app.storage().users().cached_len(), 0);

        let restarted = Application::with_config(config, false).await.unwrap();
        let reloaded = restarted.storage().users().get(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.get(&user::NICKNAME), Some("Steve".to_string()));
    }
}
