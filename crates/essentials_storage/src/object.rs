//! # Keyed Data Objects
//!
//! [`KeyedDataObject`] is the in-memory form of one stored document: a backing
//! tree plus an overlay of values already resolved through [`DataKey`]s.
//!
//! Reads resolve once. The first `get` for a path runs the key's transformation,
//! extracts the typed value from the tree and records it in the overlay; every
//! later read of that path is served from the overlay until the document is
//! reloaded. Writes only touch the overlay and set the dirty flag. The tree is
//! rebuilt from backing tree + overlay when the document is serialized.
//!
//! [`Document`] is the shared handle the storage services hand out. The cache
//! and every caller hold clones of the same `Arc`, so identity comparisons
//! ([`Document::ptr_eq`]) tell whether two handles name the same cached object.

use crate::error::{StorageError, StorageResult};
use crate::key::{DataKey, DataValue, DocumentKind};
use crate::tree::{remove_at_path, set_at_path, DataPath};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// A resolved value whose concrete type is erased in the overlay.
trait StoredValue: Send + Sync {
    fn to_node(&self) -> Result<Value, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
}

impl<V: DataValue> StoredValue for V {
    fn to_node(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum Slot {
    /// Resolved or written value.
    Present(Box<dyn StoredValue>),
    /// Resolved from the tree, nothing stored there. Leaves the tree untouched.
    Absent,
    /// Explicitly removed. Deletes the path when materialized.
    Removed,
    /// Stored node could not be read with the key's shape. Leaves the tree untouched.
    Unreadable(String),
}

pub struct KeyedDataObject<O> {
    tree: Value,
    overlay: BTreeMap<DataPath, Slot>,
    dirty: bool,
    revision: u64,
    _owner: PhantomData<fn() -> O>,
}

impl<O: DocumentKind> KeyedDataObject<O> {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::from_tree(Value::Object(Map::new()))
    }

    /// Wraps a backing tree. The document starts clean with an empty overlay.
    pub fn from_tree(tree: Value) -> Self {
        Self {
            tree,
            overlay: BTreeMap::new(),
            dirty: false,
            revision: 0,
            _owner: PhantomData,
        }
    }

    /// Returns the value for `key`, or `None` when absent.
    ///
    /// A stored value that does not match the key's shape is logged and
    /// reported as absent; use [`try_get`](Self::try_get) to observe the error.
    pub fn get<V: DataValue>(&mut self, key: &DataKey<V, O>) -> Option<V> {
        match self.resolve(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("⚠️ Ignoring unreadable {} value: {}", O::NAME, e);
                None
            }
        }
    }

    /// Strict form of [`get`](Self::get): a malformed stored value is an error.
    pub fn try_get<V: DataValue>(&mut self, key: &DataKey<V, O>) -> StorageResult<Option<V>> {
        self.resolve(key)
    }

    /// Returns the value for `key`, falling back to the key's default.
    pub fn get_or_default<V: DataValue>(&mut self, key: &DataKey<V, O>) -> Option<V> {
        self.get(key).or_else(|| key.default_value().cloned())
    }

    pub fn set<V: DataValue>(&mut self, key: &DataKey<V, O>, value: V) {
        self.write_slot(key.path(), Slot::Present(Box::new(value)));
    }

    pub fn remove<V: DataValue>(&mut self, key: &DataKey<V, O>) {
        self.write_slot(key.path(), Slot::Removed);
    }

    /// Returns true if a value is resolvable for `key`.
    pub fn has<V: DataValue>(&mut self, key: &DataKey<V, O>) -> bool {
        if let Some(slot) = self.overlay.get(key.path()) {
            return matches!(slot, Slot::Present(_));
        }
        key.perform_transformation(&mut self.tree);
        !matches!(
            crate::tree::get_at_path(&self.tree, key.path().segments()),
            None | Some(Value::Null)
        )
    }

    /// Returns a handle seeded with the current value (not the key's default).
    /// If the handle was modified, whatever it holds when dropped or
    /// [closed](ValueHandle::close) is written back, so an emptied handle
    /// removes the value. An untouched handle leaves the document as it was.
    pub fn get_and_set<'a, V: DataValue>(
        &'a mut self,
        key: &'a DataKey<V, O>,
    ) -> ValueHandle<'a, V, O> {
        let value = self.get(key);
        ValueHandle {
            document: self,
            key,
            value,
            touched: false,
            closed: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Counter bumped by every write. Lets a save detect writes that raced it.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Produces the tree to persist: the backing tree with every resolved
    /// overlay entry written over it. The document itself is not modified.
    pub fn to_tree(&self) -> StorageResult<Value> {
        let mut tree = self.tree.clone();
        // BTreeMap order applies parent paths before their children.
        for (path, slot) in &self.overlay {
            match slot {
                Slot::Present(value) => set_at_path(&mut tree, path.segments(), value.to_node()?),
                Slot::Removed => {
                    remove_at_path(&mut tree, path.segments());
                }
                Slot::Absent | Slot::Unreadable(_) => {}
            }
        }
        Ok(tree)
    }

    pub(crate) fn backing_tree(&self) -> &Value {
        &self.tree
    }

    fn write_slot(&mut self, path: &DataPath, slot: Slot) {
        self.overlay.insert(path.clone(), slot);
        self.dirty = true;
        self.revision += 1;
    }

    fn resolve<V: DataValue>(&mut self, key: &DataKey<V, O>) -> StorageResult<Option<V>> {
        if let Some(slot) = self.overlay.get(key.path()) {
            return match slot {
                Slot::Present(stored) => match stored.as_any().downcast_ref::<V>() {
                    Some(value) => Ok(Some(value.clone())),
                    None => Err(StorageError::MalformedValue {
                        path: key.path().to_string(),
                        reason: "path was resolved with a different value type".to_string(),
                    }),
                },
                Slot::Absent | Slot::Removed => Ok(None),
                Slot::Unreadable(reason) => Err(StorageError::MalformedValue {
                    path: key.path().to_string(),
                    reason: reason.clone(),
                }),
            };
        }

        key.perform_transformation(&mut self.tree);
        let (slot, result) = match key.extract(&self.tree) {
            Ok(Some(value)) => (Slot::Present(Box::new(value.clone())), Ok(Some(value))),
            Ok(None) => (Slot::Absent, Ok(None)),
            Err(StorageError::MalformedValue { path, reason }) => (
                Slot::Unreadable(reason.clone()),
                Err(StorageError::MalformedValue { path, reason }),
            ),
            Err(other) => return Err(other),
        };
        self.overlay.insert(key.path().clone(), slot);
        result
    }
}

impl<O: DocumentKind> Default for KeyedDataObject<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: DocumentKind> fmt::Debug for KeyedDataObject<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedDataObject")
            .field("kind", &O::NAME)
            .field("resolved", &self.overlay.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Scoped read-modify-write access to one value. See [`KeyedDataObject::get_and_set`].
pub struct ValueHandle<'a, V: DataValue, O: DocumentKind> {
    document: &'a mut KeyedDataObject<O>,
    key: &'a DataKey<V, O>,
    value: Option<V>,
    touched: bool,
    closed: bool,
}

impl<'a, V: DataValue, O: DocumentKind> ValueHandle<'a, V, O> {
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn value_mut(&mut self) -> &mut Option<V> {
        self.touched = true;
        &mut self.value
    }

    pub fn set(&mut self, value: V) {
        self.touched = true;
        self.value = Some(value);
    }

    pub fn clear(&mut self) {
        self.touched = true;
        self.value = None;
    }

    /// Writes the held value back now instead of at drop.
    pub fn close(mut self) {
        self.write_back();
    }

    fn write_back(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.touched {
            return;
        }
        match self.value.take() {
            Some(value) => self.document.set(self.key, value),
            None => self.document.remove(self.key),
        }
    }
}

impl<'a, V: DataValue, O: DocumentKind> Drop for ValueHandle<'a, V, O> {
    fn drop(&mut self) {
        self.write_back();
    }
}

/// Shared handle to a cached [`KeyedDataObject`].
///
/// Mutation goes through [`lock`](Self::lock), which serializes access to the
/// document across tasks. The convenience methods lock for the duration of a
/// single call.
pub struct Document<O> {
    inner: Arc<Mutex<KeyedDataObject<O>>>,
}

impl<O: DocumentKind> Document<O> {
    pub fn new(object: KeyedDataObject<O>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(object)),
        }
    }

    /// Locks the document. A lock poisoned by a panicking writer is recovered;
    /// the overlay is always left in a consistent state between calls.
    pub fn lock(&self) -> MutexGuard<'_, KeyedDataObject<O>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when both handles refer to the same cached object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn get<V: DataValue>(&self, key: &DataKey<V, O>) -> Option<V> {
        self.lock().get(key)
    }

    pub fn get_or_default<V: DataValue>(&self, key: &DataKey<V, O>) -> Option<V> {
        self.lock().get_or_default(key)
    }

    pub fn set<V: DataValue>(&self, key: &DataKey<V, O>, value: V) {
        self.lock().set(key, value)
    }

    pub fn remove<V: DataValue>(&self, key: &DataKey<V, O>) {
        self.lock().remove(key)
    }

    pub fn has<V: DataValue>(&self, key: &DataKey<V, O>) -> bool {
        self.lock().has(key)
    }

    /// Runs `f` with the document locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut KeyedDataObject<O>) -> R) -> R {
        f(&mut *self.lock())
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().is_dirty()
    }

    pub fn mark_dirty(&self, dirty: bool) {
        self.lock().mark_dirty(dirty)
    }
}

impl<O> Clone for Document<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: DocumentKind> fmt::Debug for Document<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Document").field(&*self.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::move_path;
    use serde_json::json;
    use std::collections::HashMap;

    struct Profile;
    impl DocumentKind for Profile {
        const NAME: &'static str = "profile";
    }

    fn nickname() -> DataKey<String, Profile> {
        DataKey::of(["user", "nickname"])
    }

    #[test]
    fn test_get_resolves_once_from_tree() {
        let mut doc = KeyedDataObject::<Profile>::from_tree(json!({ "user": { "nickname": "Steve" } }));
        assert_eq!(doc.get(&nickname()), Some("Steve".to_string()));
        assert!(!doc.is_dirty());

        // Overlay wins over later tree changes.
        doc.tree = json!({ "user": { "nickname": "Alex" } });
        assert_eq!(doc.get(&nickname()), Some("Steve".to_string()));
    }

    #[test]
    fn test_absent_is_cached() {
        let mut doc = KeyedDataObject::<Profile>::new();
        assert_eq!(doc.get(&nickname()), None);
        doc.tree = json!({ "user": { "nickname": "late" } });
        assert_eq!(doc.get(&nickname()), None);
    }

    #[test]
    fn test_set_then_get_and_dirty() {
        let mut doc = KeyedDataObject::<Profile>::new();
        let rev = doc.revision();
        doc.set(&nickname(), "Steve".to_string());
        assert!(doc.is_dirty());
        assert!(doc.revision() > rev);
        assert_eq!(doc.get(&nickname()), Some("Steve".to_string()));
        assert!(doc.has(&nickname()));
    }

    #[test]
    fn test_remove_then_get_and_materialize() {
        let mut doc =
            KeyedDataObject::<Profile>::from_tree(json!({ "user": { "nickname": "Steve", "age": 3 } }));
        doc.remove(&nickname());
        assert_eq!(doc.get(&nickname()), None);
        assert!(!doc.has(&nickname()));
        assert_eq!(doc.to_tree().unwrap(), json!({ "user": { "age": 3 } }));
    }

    #[test]
    fn test_get_or_default() {
        let key: DataKey<bool, Profile> = DataKey::of(["mute", "muted"]).with_default(false);
        let mut doc = KeyedDataObject::<Profile>::new();
        assert_eq!(doc.get(&key), None);
        assert_eq!(doc.get_or_default(&key), Some(false));
    }

    #[test]
    fn test_malformed_value_is_lenient_and_preserved() {
        let key: DataKey<u32, Profile> = DataKey::of(["count"]);
        let mut doc = KeyedDataObject::<Profile>::from_tree(json!({ "count": "lots" }));
        assert_eq!(doc.get(&key), None);
        assert!(matches!(doc.try_get(&key), Err(StorageError::MalformedValue { .. })));
        // Reading never destroys what was stored.
        assert_eq!(doc.to_tree().unwrap(), json!({ "count": "lots" }));
    }

    #[test]
    fn test_to_tree_leaves_unresolved_paths_alone() {
        let mut doc = KeyedDataObject::<Profile>::from_tree(json!({
            "user": { "nickname": "Steve" },
            "unknown": { "keep": [1, 2, 3] }
        }));
        doc.set(&nickname(), "Alex".to_string());
        assert_eq!(
            doc.to_tree().unwrap(),
            json!({ "user": { "nickname": "Alex" }, "unknown": { "keep": [1, 2, 3] } })
        );
    }

    #[test]
    fn test_transformer_runs_before_first_read() {
        fn lift(path: &DataPath, tree: &mut Value) {
            move_path(tree, &["homes".to_string()], path.segments());
        }
        let homes: DataKey<HashMap<String, String>, Profile> =
            DataKey::of_map(["home", "homes"]).with_transformer(lift);

        let mut doc = KeyedDataObject::<Profile>::from_tree(json!({ "homes": { "base": "here" } }));
        assert!(doc.has(&homes));
        let resolved = doc.get(&homes).unwrap();
        assert_eq!(resolved["base"], "here");
        assert_eq!(
            doc.to_tree().unwrap(),
            json!({ "home": { "homes": { "base": "here" } } })
        );
    }

    #[test]
    fn test_value_handle_writes_back() {
        let ignored: DataKey<Vec<String>, Profile> = DataKey::of_list(["ignore", "players"]);
        let mut doc = KeyedDataObject::<Profile>::new();
        {
            let mut handle = doc.get_and_set(&ignored);
            handle.value_mut().get_or_insert_with(Vec::new).push("griefer".to_string());
        }
        assert!(doc.is_dirty());
        assert_eq!(doc.get(&ignored), Some(vec!["griefer".to_string()]));

        let mut handle = doc.get_and_set(&ignored);
        handle.clear();
        handle.close();
        assert_eq!(doc.get(&ignored), None);
    }

    #[test]
    fn test_untouched_handle_leaves_defaulted_key_alone() {
        let muted: DataKey<bool, Profile> = DataKey::of(["mute", "muted"]).with_default(false);
        let mut doc = KeyedDataObject::<Profile>::from_tree(json!({ "content_version": 2 }));
        let before = doc.to_tree().unwrap();
        {
            let handle = doc.get_and_set(&muted);
            assert_eq!(handle.value(), None);
        }
        assert!(!doc.is_dirty());
        assert_eq!(doc.to_tree().unwrap(), before);
        assert!(!doc.has(&muted));
        assert_eq!(doc.get_or_default(&muted), Some(false));
    }

    #[test]
    fn test_document_identity_and_locking() {
        let doc = Document::new(KeyedDataObject::<Profile>::new());
        let same = doc.clone();
        let other = Document::new(KeyedDataObject::<Profile>::new());
        assert!(Document::ptr_eq(&doc, &same));
        assert!(!Document::ptr_eq(&doc, &other));

        same.set(&nickname(), "Steve".to_string());
        assert_eq!(doc.get(&nickname()), Some("Steve".to_string()));
        assert!(doc.is_dirty());
        doc.mark_dirty(false);
        assert!(!same.is_dirty());
        assert_eq!(doc.with(|d| d.revision()), 1);
    }
}
