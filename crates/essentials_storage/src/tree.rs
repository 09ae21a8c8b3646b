//! Path helpers over the backing tree.
//!
//! Every document wraps a generic [`serde_json::Value`] tree. Feature data
//! lives beneath feature-specific path prefixes (`["jail", "name"]`,
//! `["home", "homes"]`, ...) so migrations can rewrite one subtree without
//! touching the others.

use serde_json::{Map, Value};
use std::fmt;

/// An ordered list of map keys addressing one node of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataPath(Vec<String>);

impl DataPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl<S: Into<String>> FromIterator<S> for DataPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Returns the node at `path`, or `None` if any segment is missing or an
/// intermediate node is not a map.
pub fn get_at_path<'a>(tree: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = tree;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

pub fn get_at_path_mut<'a>(tree: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut current = tree;
    for segment in path {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// Writes `value` at `path`, creating intermediate maps on the way.
///
/// A non-map intermediate node is replaced by an empty map.
pub fn set_at_path(tree: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *tree = value;
        return;
    };

    let mut current = tree;
    for segment in parents {
        current = ensure_object(current)
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert(last.clone(), value);
}

/// Removes and returns the node at `path`. Parent maps are left in place.
pub fn take_at_path(tree: &mut Value, path: &[String]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    get_at_path_mut(tree, parents)?
        .as_object_mut()?
        .remove(last)
}

pub fn remove_at_path(tree: &mut Value, path: &[String]) -> bool {
    take_at_path(tree, path).is_some()
}

/// Moves the node at `from` to `to`. Returns false when `from` is absent.
///
/// An existing node at `to` is overwritten.
pub fn move_path(tree: &mut Value, from: &[String], to: &[String]) -> bool {
    match take_at_path(tree, from) {
        Some(value) => {
            set_at_path(tree, to, value);
            true
        }
        None => false,
    }
}

/// Returns the node's map, first replacing a non-map node with an empty one.
fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    match node {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(Map::new());
            ensure_object(other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_nested() {
        let tree = json!({ "user": { "nickname": "Steve" } });
        assert_eq!(get_at_path(&tree, &path(&["user", "nickname"])), Some(&json!("Steve")));
        assert_eq!(get_at_path(&tree, &path(&["user", "missing"])), None);
        assert_eq!(get_at_path(&tree, &path(&["user", "nickname", "deeper"])), None);
        assert_eq!(get_at_path(&tree, &[]), Some(&tree));
    }

    #[test]
    fn test_set_creates_intermediate_maps() {
        let mut tree = json!({});
        set_at_path(&mut tree, &path(&["jail", "name"]), json!("alcatraz"));
        assert_eq!(tree, json!({ "jail": { "name": "alcatraz" } }));

        let mut root = Value::Null;
        set_at_path(&mut root, &path(&["mute", "muted"]), json!(true));
        assert_eq!(root, json!({ "mute": { "muted": true } }));
    }

    #[test]
    fn test_set_replaces_scalar_intermediate() {
        let mut tree = json!({ "jail": 5 });
        set_at_path(&mut tree, &path(&["jail", "name"]), json!("alcatraz"));
        assert_eq!(tree, json!({ "jail": { "name": "alcatraz" } }));
    }

    #[test]
    fn test_take_and_remove() {
        let mut tree = json!({ "a": { "b": 1, "c": 2 } });
        assert_eq!(take_at_path(&mut tree, &path(&["a", "b"])), Some(json!(1)));
        assert!(!remove_at_path(&mut tree, &path(&["a", "b"])));
        assert!(remove_at_path(&mut tree, &path(&["a", "c"])));
        assert_eq!(tree, json!({ "a": {} }));
    }

    #[test]
    fn test_move_path() {
        let mut tree = json!({ "name": "Steve", "content_version": 1 });
        assert!(move_path(&mut tree, &path(&["name"]), &path(&["user", "nickname"])));
        assert_eq!(tree, json!({ "user": { "nickname": "Steve" }, "content_version": 1 }));
        assert!(!move_path(&mut tree, &path(&["name"]), &path(&["user", "nickname"])));
    }

    #[test]
    fn test_data_path_display() {
        let p = DataPath::new(["home", "homes"]);
        assert_eq!(p.to_string(), "home.homes");
        assert!(!p.is_root());
        assert!(DataPath::new(Vec::<String>::new()).is_root());
    }
}
