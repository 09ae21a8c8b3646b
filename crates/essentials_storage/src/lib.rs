//! # Essentials Storage
//!
//! Persistent, versioned document storage for the Essentials server plugin.
//!
//! ## Overview
//!
//! Player, world and server-wide data is stored as JSON documents. Features
//! never touch the raw JSON; they declare typed [`DataKey`]s and read or write
//! through them:
//!
//! ```rust,no_run
//! use essentials_storage::documents::user;
//! use essentials_storage::{PlayerId, StorageConfig, StorageManager};
//!
//! # async fn example() -> essentials_storage::StorageResult<()> {
//! let storage = StorageManager::open(StorageConfig::default()).await?;
//! let player = PlayerId::new();
//!
//! let doc = storage.users().get_or_new(&player).await?;
//! doc.set(&user::NICKNAME, "Steve".to_string());
//! storage.users().save(&player, &doc).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! - [`DataKey`] / [`KeyedDataObject`]: typed access to one document
//! - [`DataTranslator`]: bytes to documents and back, running content migrations
//! - [`KeyedRepository`] / [`SingleRepository`]: raw byte storage
//! - [`KeyedStorageService`] / [`SingleCachedService`]: caching on top of a repository
//! - [`UserCacheService`]: derived index over all user documents
//! - [`StorageManager`]: owns and wires all of the above

pub mod config;
pub mod documents;
pub mod error;
pub mod key;
pub mod manager;
pub mod object;
pub mod repository;
pub mod service;
pub mod single;
pub mod translator;
pub mod tree;
pub mod types;
pub mod usercache;

pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use key::{DataKey, DataValue, DocumentKind, KeyShape, Transformer};
pub use manager::{StorageBackends, StorageManager};
pub use object::{Document, KeyedDataObject, ValueHandle};
pub use repository::{
    FileKey, FlatFileRepository, FlatFileSingleRepository, InMemoryRepository,
    InMemorySingleRepository, KeyedRepository, SingleRepository, StorageKey,
};
pub use service::{
    ActiveEntities, EntryState, EvictionOutcome, KeyQuery, KeyedStorageService, PresenceReadmission,
    Readmission, ReadmissionCheck,
};
pub use single::SingleCachedService;
pub use translator::{DataTranslator, FnMigration, MigrationStep, CONTENT_VERSION_FIELD};
pub use tree::DataPath;
pub use types::{InvalidWorldKey, PlayerId, WorldKey};
pub use usercache::{UserCacheEntry, UserCacheService, UserCacheSnapshot, USER_CACHE_VERSION};
