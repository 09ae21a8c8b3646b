//! # Entity Key Types
//!
//! Identifiers for the entities that own keyed documents.
//!
//! - [`PlayerId`] - a player (user documents are keyed by it)
//! - [`WorldKey`] - a namespaced world identifier (world documents)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a player.
///
/// Wrapper around a UUID so player ids cannot be confused with other
/// identifiers in the storage layer.
///
/// # Examples
///
/// ```rust
/// use essentials_storage::PlayerId;
///
/// let player_id: PlayerId = "550e8400-e29b-41d4-a716-446655440000".parse()?;
/// println!("Player ID: {}", player_id);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random player ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::str::FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespaced world identifier, written `namespace:value` (e.g. `minecraft:overworld`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldKey {
    pub namespace: String,
    pub value: String,
}

impl WorldKey {
    pub fn new(namespace: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            value: value.into(),
        }
    }

    /// True when both parts are usable as single file-name components.
    pub fn is_valid(&self) -> bool {
        is_plain_segment(&self.namespace) && is_plain_segment(&self.value)
    }
}

/// Non-empty, not `.`/`..`, and free of separators.
fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(|c: char| matches!(c, '/' | '\\' | ':' | '\0'))
}

/// Error returned when a string is not a valid `namespace:value` world key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid world key: '{0}' (expected namespace:value)")]
pub struct InvalidWorldKey(pub String);

impl std::str::FromStr for WorldKey {
    type Err = InvalidWorldKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, value)) if is_plain_segment(namespace) && is_plain_segment(value) => {
                Ok(Self::new(namespace, value))
            }
            _ => Err(InvalidWorldKey(s.to_string())),
        }
    }
}

impl std::fmt::Display for WorldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_parse_and_display() {
        let raw = "550e8400-e29b-41d4-a716-446655440000";
        let id: PlayerId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
        assert!("not-a-uuid".parse::<PlayerId>().is_err());
    }

    #[test]
    fn test_world_key_parse() {
        let key: WorldKey = "minecraft:the_nether".parse().unwrap();
        assert_eq!(key.namespace, "minecraft");
        assert_eq!(key.value, "the_nether");
        assert_eq!(key.to_string(), "minecraft:the_nether");

        assert!("overworld".parse::<WorldKey>().is_err());
        assert!(":overworld".parse::<WorldKey>().is_err());
        assert!("a:b:c".parse::<WorldKey>().is_err());
    }

    #[test]
    fn test_world_key_rejects_path_segments() {
        for raw in [
            "minecraft:../../../escaped",
            "minecraft:..",
            "..:overworld",
            ".:overworld",
            "minecraft:nested/world",
            "minecraft:nested\\world",
            "mine/craft:overworld",
        ] {
            assert!(raw.parse::<WorldKey>().is_err(), "{} should be rejected", raw);
        }
        assert!(!WorldKey::new("minecraft", "../escaped").is_valid());
        assert!(WorldKey::new("minecraft", "the_end").is_valid());
    }
}
