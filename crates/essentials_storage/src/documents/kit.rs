//! Kit definitions, stored as one server-wide document.
//!
//! Version 0 kits carried an `interval` field that was replaced by per-kit
//! cooldowns; the v0 migration strips it.

use crate::key::{DataKey, DocumentKind};
use crate::translator::{DataTranslator, FnMigration};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub struct KitData;

impl DocumentKind for KitData {
    const NAME: &'static str = "kit";
}

pub const CONTENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitDefinition {
    /// Item stacks in the host's item notation.
    #[serde(default)]
    pub items: Vec<String>,
    /// Seconds before the kit can be redeemed again. `None` means once only.
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

pub static KITS: Lazy<DataKey<HashMap<String, KitDefinition>, KitData>> =
    Lazy::new(|| DataKey::of_map(["kits"]));

fn strip_intervals(tree: &mut Value) -> Result<(), String> {
    if let Some(kits) = tree.get_mut("kits").and_then(Value::as_object_mut) {
        for kit in kits.values_mut() {
            if let Some(kit) = kit.as_object_mut() {
                kit.remove("interval");
            }
        }
    }
    Ok(())
}

pub fn translator() -> DataTranslator<KitData> {
    DataTranslator::new(
        CONTENT_VERSION,
        vec![FnMigration::boxed(0, "remove kit interval", strip_intervals)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v0_kits_lose_interval() {
        let t = translator();
        let mut doc = t
            .from_external(
                br#"{ "kits": { "starter": { "items": ["stone_sword"], "interval": 30 } } }"#,
            )
            .unwrap();

        let tree = t.to_tree(&doc).unwrap();
        assert!(tree["kits"]["starter"].get("interval").is_none());

        let kits = doc.get(&KITS).unwrap();
        assert_eq!(kits["starter"].items, vec!["stone_sword".to_string()]);
        assert_eq!(kits["starter"].cooldown_seconds, None);
    }

    #[test]
    fn test_v1_kits_untouched() {
        let t = translator();
        let doc = t
            .from_external(br#"{ "kits": { "starter": { "interval": 30 } }, "content_version": 1 }"#)
            .unwrap();
        let tree = t.to_tree(&doc).unwrap();
        assert_eq!(tree["kits"]["starter"]["interval"], serde_json::json!(30));
    }
}
