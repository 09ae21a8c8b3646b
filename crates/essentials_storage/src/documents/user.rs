//! Per-player documents.
//!
//! Content history:
//! - v1 kept the nickname in a top-level `name` field and homes in a
//!   top-level `homes` map.
//! - v2 moved every feature under its own prefix. The nickname move is a
//!   migration; the homes move is done lazily by the `HOMES` key.

use super::Location;
use crate::key::{DataKey, DocumentKind};
use crate::translator::{DataTranslator, FnMigration};
use crate::tree::{move_path, DataPath};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;

pub struct UserData;

impl DocumentKind for UserData {
    const NAME: &'static str = "user";
}

pub const CONTENT_VERSION: u32 = 2;

pub static NICKNAME: Lazy<DataKey<String, UserData>> = Lazy::new(|| DataKey::of(["user", "nickname"]));

/// Last address the player connected from, as text.
pub static LAST_IP: Lazy<DataKey<String, UserData>> = Lazy::new(|| DataKey::of(["user", "last_ip"]));

pub static FIRST_JOIN: Lazy<DataKey<DateTime<Utc>, UserData>> =
    Lazy::new(|| DataKey::of(["user", "first_join"]));

/// Name of the jail the player is held in.
pub static JAIL: Lazy<DataKey<String, UserData>> = Lazy::new(|| DataKey::of(["jail", "name"]));

pub static MUTED: Lazy<DataKey<bool, UserData>> =
    Lazy::new(|| DataKey::of(["mute", "muted"]).with_default(false));

pub static HOMES: Lazy<DataKey<HashMap<String, Location>, UserData>> =
    Lazy::new(|| DataKey::of_map(["home", "homes"]).with_transformer(lift_legacy_homes));

pub static IGNORED_PLAYERS: Lazy<DataKey<Vec<String>, UserData>> =
    Lazy::new(|| DataKey::of_list(["ignore", "players"]));

/// Kit name to redemption timestamps (epoch milliseconds).
pub static KIT_REDEMPTIONS: Lazy<DataKey<HashMap<String, Vec<i64>>, UserData>> =
    Lazy::new(|| DataKey::of_map_list(["kit", "redeemed"]));

fn lift_legacy_homes(path: &DataPath, tree: &mut Value) {
    let legacy = ["homes".to_string()];
    if tree.get("homes").is_some() && crate::tree::get_at_path(tree, path.segments()).is_none() {
        move_path(tree, &legacy, path.segments());
    }
}

fn move_nickname(tree: &mut Value) -> Result<(), String> {
    move_path(
        tree,
        &["name".to_string()],
        &["user".to_string(), "nickname".to_string()],
    );
    Ok(())
}

pub fn translator() -> DataTranslator<UserData> {
    DataTranslator::new(
        CONTENT_VERSION,
        vec![FnMigration::boxed(1, "move name to user.nickname", move_nickname)],
    )
}
