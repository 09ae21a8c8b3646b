//! # Data Keys
//!
//! A [`DataKey`] is the only way a document is read or written. Each key names
//! a path into the document's backing tree, the type of the value stored
//! there, an optional default, and an optional transformation that normalizes
//! legacy layouts before the first read.
//!
//! The owner parameter `O` is a zero-sized [`DocumentKind`] marker, so a key
//! declared for user documents cannot be applied to a world document:
//!
//! ```rust
//! use essentials_storage::{DataKey, DocumentKind};
//!
//! struct PlayerStats;
//! impl DocumentKind for PlayerStats {
//!     const NAME: &'static str = "player-stats";
//! }
//!
//! let kills: DataKey<u32, PlayerStats> = DataKey::of(["stats", "kills"]).with_default(0);
//! assert_eq!(kills.path().to_string(), "stats.kills");
//! ```
//!
//! ## Shapes
//!
//! | Constructor  | Value type                   | Extraction                         |
//! |--------------|------------------------------|------------------------------------|
//! | `of`         | `V`                          | whole node                         |
//! | `of_list`    | `Vec<T>`                     | per element, bad elements skipped  |
//! | `of_map`     | `HashMap<String, T>`         | per entry, bad entries skipped     |
//! | `of_map_list`| `HashMap<String, Vec<T>>`    | per entry and per element          |
//!
//! Keys are shared by every document of their kind. Two keys must not resolve
//! the same path of the same document from different threads; the
//! [`Document`](crate::Document) lock serializes access per document.

use crate::error::{StorageError, StorageResult};
use crate::tree::{get_at_path, DataPath};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use tracing::warn;

/// Marker trait for a family of documents (users, worlds, kits, ...).
pub trait DocumentKind: Send + Sync + 'static {
    /// Short name used in log output.
    const NAME: &'static str;
}

/// Values that can live in a document.
pub trait DataValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> DataValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Normalization hook run against the backing tree before a key's first read.
///
/// Receives the key's own path. Must be idempotent: it can run once per
/// document load and again after a reload.
pub type Transformer = fn(&DataPath, &mut Value);

type Extractor<V> = fn(&Value, &DataPath) -> Result<V, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    Scalar,
    List,
    Map,
    MapList,
}

/// Typed, path-addressed descriptor for one value in documents of kind `O`.
pub struct DataKey<V, O> {
    path: DataPath,
    shape: KeyShape,
    default: Option<V>,
    transformer: Option<Transformer>,
    extract: Extractor<V>,
    _owner: PhantomData<fn() -> O>,
}

impl<V: DataValue, O: DocumentKind> DataKey<V, O> {
    /// Declares a scalar key: the whole node at `path` deserializes into `V`.
    pub fn of<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_shape(DataPath::new(path), KeyShape::Scalar, extract_scalar::<V>)
    }

    fn with_shape(path: DataPath, shape: KeyShape, extract: Extractor<V>) -> Self {
        Self {
            path,
            shape,
            default: None,
            transformer: None,
            extract,
            _owner: PhantomData,
        }
    }

    pub fn with_default(mut self, default: V) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn path(&self) -> &DataPath {
        &self.path
    }

    pub fn shape(&self) -> KeyShape {
        self.shape
    }

    pub fn default_value(&self) -> Option<&V> {
        self.default.as_ref()
    }

    /// Name of the document kind this key belongs to.
    pub fn owner(&self) -> &'static str {
        O::NAME
    }

    /// Runs the key's transformation, if any, against `tree`.
    pub fn perform_transformation(&self, tree: &mut Value) {
        if let Some(transform) = self.transformer {
            transform(&self.path, tree);
        }
    }

    /// Reads this key's value out of a backing tree.
    ///
    /// `Ok(None)` when nothing (or `null`) is stored at the path;
    /// [`StorageError::MalformedValue`] when the stored node has the wrong shape.
    pub fn extract(&self, tree: &Value) -> StorageResult<Option<V>> {
        match get_at_path(tree, self.path.segments()) {
            None | Some(Value::Null) => Ok(None),
            Some(node) => (self.extract)(node, &self.path).map(Some).map_err(|reason| {
                StorageError::MalformedValue {
                    path: self.path.to_string(),
                    reason,
                }
            }),
        }
    }
}

impl<T: DataValue, O: DocumentKind> DataKey<Vec<T>, O> {
    /// Declares a list key. Elements that do not deserialize into `T` are skipped.
    pub fn of_list<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_shape(DataPath::new(path), KeyShape::List, extract_list::<T>)
    }
}

impl<T: DataValue, O: DocumentKind> DataKey<HashMap<String, T>, O> {
    /// Declares a string-keyed map key. Entries that do not deserialize into `T` are skipped.
    pub fn of_map<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_shape(DataPath::new(path), KeyShape::Map, extract_map::<T>)
    }
}

impl<T: DataValue, O: DocumentKind> DataKey<HashMap<String, Vec<T>>, O> {
    /// Declares a string-keyed map of lists.
    pub fn of_map_list<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_shape(DataPath::new(path), KeyShape::MapList, extract_map_list::<T>)
    }
}

impl<V: Clone, O> Clone for DataKey<V, O> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            shape: self.shape,
            default: self.default.clone(),
            transformer: self.transformer,
            extract: self.extract,
            _owner: PhantomData,
        }
    }
}

impl<V, O: DocumentKind> fmt::Debug for DataKey<V, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("owner", &O::NAME)
            .field("path", &self.path.to_string())
            .field("shape", &self.shape)
            .field("has_default", &self.default.is_some())
            .field("has_transformer", &self.transformer.is_some())
            .finish()
    }
}

fn node_kind(node: &Value) -> &'static str {
    match node {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn extract_scalar<V: DataValue>(node: &Value, _path: &DataPath) -> Result<V, String> {
    V::deserialize(node).map_err(|e| e.to_string())
}

fn extract_list<T: DataValue>(node: &Value, path: &DataPath) -> Result<Vec<T>, String> {
    let items = node
        .as_array()
        .ok_or_else(|| format!("expected a list, found a {}", node_kind(node)))?;
    Ok(collect_elements(items, path, None))
}

fn extract_map<T: DataValue>(node: &Value, path: &DataPath) -> Result<HashMap<String, T>, String> {
    let entries = node
        .as_object()
        .ok_or_else(|| format!("expected a map, found a {}", node_kind(node)))?;

    let mut result = HashMap::with_capacity(entries.len());
    for (name, value) in entries {
        match T::deserialize(value) {
            Ok(v) => {
                result.insert(name.clone(), v);
            }
            Err(e) => warn!("⚠️ Skipping malformed entry '{}' at '{}': {}", name, path, e),
        }
    }
    Ok(result)
}

fn extract_map_list<T: DataValue>(
    node: &Value,
    path: &DataPath,
) -> Result<HashMap<String, Vec<T>>, String> {
    let entries = node
        .as_object()
        .ok_or_else(|| format!("expected a map, found a {}", node_kind(node)))?;

    let mut result = HashMap::with_capacity(entries.len());
    for (name, value) in entries {
        match value.as_array() {
            Some(items) => {
                result.insert(name.clone(), collect_elements(items, path, Some(name)));
            }
            None => warn!(
                "⚠️ Skipping entry '{}' at '{}': expected a list, found a {}",
                name,
                path,
                node_kind(value)
            ),
        }
    }
    Ok(result)
}

fn collect_elements<T: DataValue>(items: &[Value], path: &DataPath, entry: Option<&str>) -> Vec<T> {
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match T::deserialize(item) {
            Ok(v) => Some(v),
            Err(e) => {
                match entry {
                    Some(name) => warn!(
                        "⚠️ Skipping malformed element {} of '{}' at '{}': {}",
                        index, name, path, e
                    ),
                    None => warn!("⚠️ Skipping malformed element {} at '{}': {}", index, path, e),
                }
                None
            }
        })
        .collect()
}
