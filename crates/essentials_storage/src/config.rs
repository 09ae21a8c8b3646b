//! Runtime settings for the storage layer.

use std::path::PathBuf;
use std::time::Duration;

/// Storage settings, usually built from the application config file.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all flat-file documents.
    pub data_directory: PathBuf,
    /// Unpinned documents idle this long are evicted by the sweep.
    pub cache_idle_timeout: Duration,
    /// Copy the previous document to `<file>.bak` before overwriting it.
    pub backup_on_save: bool,
    /// Number of user documents loaded per user-cache rebuild batch.
    pub rebuild_batch_size: usize,
    /// Upper bound on concurrent document loads during bulk operations.
    pub max_concurrent_loads: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("data"),
            cache_idle_timeout: Duration::from_secs(300),
            backup_on_save: true,
            rebuild_batch_size: 10,
            max_concurrent_loads: num_cpus::get(),
        }
    }
}

impl StorageConfig {
    pub fn users_directory(&self) -> PathBuf {
        self.data_directory.join("users")
    }

    pub fn worlds_directory(&self) -> PathBuf {
        self.data_directory.join("worlds")
    }

    pub fn general_file(&self) -> PathBuf {
        self.data_directory.join("general.json")
    }

    pub fn kits_file(&self) -> PathBuf {
        self.data_directory.join("kits.json")
    }

    pub fn user_cache_file(&self) -> PathBuf {
        self.data_directory.join("usercache.json")
    }
}
