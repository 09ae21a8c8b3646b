//! Configuration management for the Essentials storage host.
//!
//! This module handles loading, validation, and conversion of host configuration
//! from TOML files into the settings the storage layer consumes.

use essentials_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

fn default_data_directory() -> String {
    "data".to_string()
}

fn default_cache_idle_seconds() -> u64 {
    300
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_backup_on_save() -> bool {
    true
}

fn default_rebuild_batch_size() -> usize {
    10
}

fn default_max_concurrent_loads() -> usize {
    num_cpus::get()
}

fn default_rebuild_on_startup() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Host configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where and how documents are stored
    #[serde(default)]
    pub storage: StorageSettings,
    /// User cache (derived index) settings
    #[serde(default)]
    pub user_cache: UserCacheSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Document storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory for every flat-file document
    #[serde(default = "default_data_directory")]
    pub data_directory: String,
    /// Unpinned documents idle for this many seconds are evicted
    #[serde(default = "default_cache_idle_seconds")]
    pub cache_idle_seconds: u64,
    /// How often the idle sweep runs (0 disables it)
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Keep a `.bak` copy of the previous file on every save
    #[serde(default = "default_backup_on_save")]
    pub backup_on_save: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            cache_idle_seconds: default_cache_idle_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            backup_on_save: default_backup_on_save(),
        }
    }
}

/// User cache settings.
///
/// A rebuild loads every user document in batches of `rebuild_batch_size`
/// and trims the document cache after each batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCacheSettings {
    #[serde(default = "default_rebuild_batch_size")]
    pub rebuild_batch_size: usize,
    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,
    /// Rebuild at startup when the stored snapshot is missing or outdated
    #[serde(default = "default_rebuild_on_startup")]
    pub rebuild_on_startup: bool,
}

impl Default for UserCacheSettings {
    fn default() -> Self {
        Self {
            rebuild_batch_size: default_rebuild_batch_size(),
            max_concurrent_loads: default_max_concurrent_loads(),
            rebuild_on_startup: default_rebuild_on_startup(),
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
    /// Optional file that receives a copy of every log line
    #[serde(default)]
    pub file_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the specified path
    /// and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if loading/creation failed.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the file-level settings into the storage layer's configuration.
    pub fn to_storage_config(&self) -> StorageConfig {
        StorageConfig {
            data_directory: PathBuf::from(&self.storage.data_directory),
            cache_idle_timeout: Duration::from_secs(self.storage.cache_idle_seconds),
            backup_on_save: self.storage.backup_on_save,
            rebuild_batch_size: self.user_cache.rebuild_batch_size,
            max_concurrent_loads: self.user_cache.max_concurrent_loads,
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.storage.data_directory.trim().is_empty() {
            return Err("Storage data directory cannot be empty".to_string());
        }

        if self.user_cache.rebuild_batch_size == 0 {
            return Err("user_cache.rebuild_batch_size must be greater than 0".to_string());
        }

        if self.user_cache.max_concurrent_loads == 0 {
            return Err("user_cache.max_concurrent_loads must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
