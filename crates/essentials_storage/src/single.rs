//! Cached access to a single, unkeyed document (warps, kits, server-wide state).

use crate::error::StorageResult;
use crate::key::DocumentKind;
use crate::object::{Document, KeyedDataObject};
use crate::repository::SingleRepository;
use crate::translator::DataTranslator;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

pub struct SingleCachedService<O: DocumentKind> {
    name: String,
    translator: Arc<DataTranslator<O>>,
    repository: Arc<dyn SingleRepository>,
    cached: RwLock<Option<Document<O>>>,
}

impl<O: DocumentKind> SingleCachedService<O> {
    pub fn new(
        name: impl Into<String>,
        translator: Arc<DataTranslator<O>>,
        repository: Arc<dyn SingleRepository>,
    ) -> Self {
        Self {
            name: name.into(),
            translator,
            repository,
            cached: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_new(&self) -> KeyedDataObject<O> {
        self.translator.create_new()
    }

    /// Returns the cached document, loading it on first use.
    pub async fn get(&self) -> StorageResult<Option<Document<O>>> {
        if let Some(document) = self.cached.read().await.as_ref() {
            return Ok(Some(document.clone()));
        }

        let mut cached = self.cached.write().await;
        if let Some(document) = cached.as_ref() {
            return Ok(Some(document.clone()));
        }
        let loaded = self.load().await?.map(Document::new);
        if let Some(document) = &loaded {
            *cached = Some(document.clone());
        }
        Ok(loaded)
    }

    /// Returns the cached document, creating an unsaved fresh one if none is stored.
    pub async fn get_or_new(&self) -> StorageResult<Document<O>> {
        if let Some(document) = self.get().await? {
            return Ok(document);
        }
        let mut cached = self.cached.write().await;
        let document = cached
            .get_or_insert_with(|| {
                debug!("🆕 Creating new {} document", O::NAME);
                Document::new(self.translator.create_new())
            })
            .clone();
        Ok(document)
    }

    /// Whatever is cached, without touching the repository.
    pub async fn get_cached(&self) -> Option<Document<O>> {
        self.cached.read().await.clone()
    }

    /// Forces a read from the repository. A stored document replaces the
    /// cached one; if nothing is stored the cache is left as it was.
    pub async fn reload(&self) -> StorageResult<Option<Document<O>>> {
        let loaded = self.load().await?.map(Document::new);
        if let Some(document) = &loaded {
            *self.cached.write().await = Some(document.clone());
            info!("🔄 {}: reloaded from {}", self.name, self.repository.describe());
        }
        Ok(loaded)
    }

    /// Persists `document` and makes it the cached instance.
    pub async fn save(&self, document: &Document<O>) -> StorageResult<()> {
        let (bytes, revision) = {
            let guard = document.lock();
            (self.translator.to_external(&guard)?, guard.revision())
        };

        if let Err(e) = self.repository.save(&bytes).await {
            error!("❌ {}: failed to save: {}", self.name, e);
            return Err(e);
        }

        document.with(|object| {
            if object.revision() == revision {
                object.mark_dirty(false);
            }
        });
        *self.cached.write().await = Some(document.clone());
        Ok(())
    }

    /// Saves the cached document if one exists. Returns whether anything was written.
    pub async fn save_cached(&self) -> StorageResult<bool> {
        match self.get_cached().await {
            Some(document) => {
                self.save(&document).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Saves the cached document only when it has unsaved changes.
    pub async fn ensure_saved(&self) -> StorageResult<bool> {
        match self.get_cached().await {
            Some(document) if document.is_dirty() => {
                self.save(&document).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Whether the document is stored, regardless of the cache.
    pub async fn exists(&self) -> StorageResult<bool> {
        self.repository.exists().await
    }

    pub async fn clear_cache(&self) {
        *self.cached.write().await = None;
        self.repository.clear_cache().await;
    }

    async fn load(&self) -> StorageResult<Option<KeyedDataObject<O>>> {
        let Some(bytes) = self.repository.load().await? else {
            return Ok(None);
        };
        match self.translator.from_external(&bytes) {
            Ok(object) => Ok(Some(object)),
            Err(e) => {
                error!("❌ {}: failed to load {} document: {}", self.name, O::NAME, e);
                Err(e)
            }
        }
    }
}
