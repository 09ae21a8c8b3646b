//! # Data Translator
//!
//! Converts between repository bytes and [`KeyedDataObject`]s, running the
//! content migrations registered for a document kind on the way in.
//!
//! Every persisted document carries its content version in the top-level
//! `content_version` field. A document without one is treated as version 0.
//! On load, each migration whose input version lies in
//! `[stored_version, current_version)` is applied in ascending order; the
//! result is stamped with the current version.

use crate::error::{StorageError, StorageResult};
use crate::key::DocumentKind;
use crate::object::KeyedDataObject;
use serde_json::{Map, Value};
use std::marker::PhantomData;
use tracing::debug;

/// Top-level field holding a document's content version.
pub const CONTENT_VERSION_FIELD: &str = "content_version";

/// One upgrade step from `input_version` to `input_version + 1`.
pub trait MigrationStep: Send + Sync {
    fn input_version(&self) -> u32;

    /// Human-readable description used in logs.
    fn name(&self) -> &str;

    /// Rewrites the tree. Steps must be idempotent.
    fn update(&self, tree: &mut Value) -> Result<(), String>;
}

/// [`MigrationStep`] backed by a plain function.
pub struct FnMigration {
    input_version: u32,
    name: &'static str,
    apply: fn(&mut Value) -> Result<(), String>,
}

impl FnMigration {
    pub fn new(input_version: u32, name: &'static str, apply: fn(&mut Value) -> Result<(), String>) -> Self {
        Self {
            input_version,
            name,
            apply,
        }
    }

    pub fn boxed(
        input_version: u32,
        name: &'static str,
        apply: fn(&mut Value) -> Result<(), String>,
    ) -> Box<dyn MigrationStep> {
        Box::new(Self::new(input_version, name, apply))
    }
}

impl MigrationStep for FnMigration {
    fn input_version(&self) -> u32 {
        self.input_version
    }

    fn name(&self) -> &str {
        self.name
    }

    fn update(&self, tree: &mut Value) -> Result<(), String> {
        (self.apply)(tree)
    }
}

pub struct DataTranslator<O> {
    current_version: u32,
    migrations: Vec<Box<dyn MigrationStep>>,
    _owner: PhantomData<fn() -> O>,
}

impl<O: DocumentKind> DataTranslator<O> {
    /// Creates a translator producing documents at `current_version`.
    ///
    /// Migrations are sorted by input version; registration order is kept for
    /// steps sharing an input version.
    pub fn new(current_version: u32, mut migrations: Vec<Box<dyn MigrationStep>>) -> Self {
        migrations.sort_by_key(|step| step.input_version());
        Self {
            current_version,
            migrations,
            _owner: PhantomData,
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// A fresh, empty document stamped with the current version.
    pub fn create_new(&self) -> KeyedDataObject<O> {
        let mut root = Map::new();
        root.insert(CONTENT_VERSION_FIELD.to_string(), Value::from(self.current_version));
        KeyedDataObject::from_tree(Value::Object(root))
    }

    /// Reads the content version of a stored tree. Missing means 0.
    pub fn stored_version(tree: &Value) -> StorageResult<u32> {
        match tree.get(CONTENT_VERSION_FIELD) {
            None | Some(Value::Null) => Ok(0),
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    StorageError::Load(format!("invalid {} value: {}", CONTENT_VERSION_FIELD, value))
                }),
        }
    }

    /// Upgrades a stored tree to the current version.
    pub fn migrate(&self, mut tree: Value) -> StorageResult<Value> {
        let stored = Self::stored_version(&tree)?;
        if stored > self.current_version {
            return Err(StorageError::UnsupportedVersion {
                found: stored,
                supported: self.current_version,
            });
        }

        for step in self
            .migrations
            .iter()
            .filter(|step| step.input_version() >= stored && step.input_version() < self.current_version)
        {
            debug!(
                "🔧 Migrating {} document from v{}: {}",
                O::NAME,
                step.input_version(),
                step.name()
            );
            step.update(&mut tree).map_err(|reason| StorageError::Migration {
                from: step.input_version(),
                reason,
            })?;
            if !tree.is_object() {
                return Err(StorageError::Migration {
                    from: step.input_version(),
                    reason: "migration replaced the document root with a non-map".to_string(),
                });
            }
        }

        if let Value::Object(root) = &mut tree {
            root.insert(CONTENT_VERSION_FIELD.to_string(), Value::from(self.current_version));
        }
        Ok(tree)
    }

    /// Builds a document from an already-parsed stored tree.
    pub fn from_tree(&self, tree: Value) -> StorageResult<KeyedDataObject<O>> {
        if !tree.is_object() {
            return Err(StorageError::Load("document root is not a map".to_string()));
        }
        Ok(KeyedDataObject::from_tree(self.migrate(tree)?))
    }

    /// Parses repository bytes into a migrated document.
    pub fn from_external(&self, bytes: &[u8]) -> StorageResult<KeyedDataObject<O>> {
        let tree: Value = serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Load(format!("unparseable {} document: {}", O::NAME, e)))?;
        self.from_tree(tree)
    }

    /// Materializes the document tree and stamps the current version.
    pub fn to_tree(&self, document: &KeyedDataObject<O>) -> StorageResult<Value> {
        let mut tree = document
            .to_tree()
            .map_err(|e| StorageError::Save(format!("could not serialize {} document: {}", O::NAME, e)))?;
        match &mut tree {
            Value::Object(root) => {
                root.insert(CONTENT_VERSION_FIELD.to_string(), Value::from(self.current_version));
            }
            _ => return Err(StorageError::Save("document root is not a map".to_string())),
        }
        Ok(tree)
    }

    /// Serializes the document into repository bytes.
    pub fn to_external(&self, document: &KeyedDataObject<O>) -> StorageResult<Vec<u8>> {
        let tree = self.to_tree(document)?;
        serde_json::to_vec_pretty(&tree)
            .map_err(|e| StorageError::Save(format!("could not encode {} document: {}", O::NAME, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DataKey;
    use crate::tree::move_path;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Profile;
    impl DocumentKind for Profile {
        const NAME: &'static str = "profile";
    }

    fn rename_name(tree: &mut Value) -> Result<(), String> {
        move_path(tree, &["name".to_string()], &["user".to_string(), "nickname".to_string()]);
        Ok(())
    }

    fn translator() -> DataTranslator<Profile> {
        DataTranslator::new(2, vec![FnMigration::boxed(1, "move name", rename_name)])
    }

    #[test]
    fn test_create_new_is_stamped() {
        let t = translator();
        let doc = t.create_new();
        assert_eq!(doc.backing_tree(), &json!({ "content_version": 2 }));
        assert!(!doc.is_dirty());
    }

    #[test]
    fn test_migration_applies_from_stored_version() {
        let t = translator();
        let mut doc = t
            .from_external(br#"{"name":"Steve","content_version":1}"#)
            .unwrap();
        let key: DataKey<String, Profile> = DataKey::of(["user", "nickname"]);
        assert_eq!(doc.get(&key), Some("Steve".to_string()));
        assert_eq!(
            doc.backing_tree(),
            &json!({ "user": { "nickname": "Steve" }, "content_version": 2 })
        );
    }

    #[test]
    fn test_current_version_skips_migrations() {
        let t = translator();
        let doc = t.from_external(br#"{"name":"Steve","content_version":2}"#).unwrap();
        assert_eq!(doc.backing_tree()["name"], json!("Steve"));
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let t = translator();
        let result = t.from_external(br#"{"content_version":7}"#);
        assert!(matches!(
            result,
            Err(StorageError::UnsupportedVersion { found: 7, supported: 2 })
        ));
    }

    #[test]
    fn test_garbage_is_load_error() {
        let t = translator();
        assert!(matches!(t.from_external(b"{not json"), Err(StorageError::Load(_))));
        assert!(matches!(t.from_external(b"[1,2]"), Err(StorageError::Load(_))));
        assert!(matches!(
            t.from_external(br#"{"content_version":"two"}"#),
            Err(StorageError::Load(_))
        ));
    }

    #[test]
    fn test_failing_step_is_migration_error() {
        fn fail(_: &mut Value) -> Result<(), String> {
            Err("corrupt homes".to_string())
        }
        let t: DataTranslator<Profile> = DataTranslator::new(1, vec![FnMigration::boxed(0, "fail", fail)]);
        assert!(matches!(
            t.from_external(b"{}"),
            Err(StorageError::Migration { from: 0, .. })
        ));
    }

    #[test]
    fn test_steps_run_in_ascending_order() {
        struct Recording {
            version: u32,
            log: Arc<AtomicUsize>,
        }
        impl MigrationStep for Recording {
            fn input_version(&self) -> u32 {
                self.version
            }
            fn name(&self) -> &str {
                "recording"
            }
            fn update(&self, tree: &mut Value) -> Result<(), String> {
                let seen = self.log.fetch_add(1, Ordering::SeqCst);
                tree[format!("step{}", self.version)] = json!(seen);
                Ok(())
            }
        }

        let log = Arc::new(AtomicUsize::new(0));
        let steps: Vec<Box<dyn MigrationStep>> = vec![
            Box::new(Recording { version: 2, log: log.clone() }),
            Box::new(Recording { version: 0, log: log.clone() }),
            Box::new(Recording { version: 1, log: log.clone() }),
        ];
        let t: DataTranslator<Profile> = DataTranslator::new(3, steps);
        let doc = t.from_external(br#"{"content_version":1}"#).unwrap();
        let tree = doc.backing_tree();
        assert!(tree.get("step0").is_none());
        assert_eq!(tree["step1"], json!(0));
        assert_eq!(tree["step2"], json!(1));
    }

    #[test]
    fn test_serialization_is_idempotent() {
        let t = translator();
        let key: DataKey<String, Profile> = DataKey::of(["user", "nickname"]);
        let mut doc = t.create_new();
        doc.set(&key, "Steve".to_string());

        let first = t.to_external(&doc).unwrap();
        let reloaded = t.from_external(&first).unwrap();
        let second = t.to_external(&reloaded).unwrap();
        assert_eq!(first, second);
    }
}
