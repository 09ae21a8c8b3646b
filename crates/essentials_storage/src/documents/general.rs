//! Server-wide document: warps and the first-join spawn.

use super::Location;
use crate::key::{DataKey, DocumentKind};
use crate::translator::DataTranslator;
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub struct GeneralData;

impl DocumentKind for GeneralData {
    const NAME: &'static str = "general";
}

pub const CONTENT_VERSION: u32 = 1;

pub static WARPS: Lazy<DataKey<HashMap<String, Location>, GeneralData>> =
    Lazy::new(|| DataKey::of_map(["warp", "warps"]));

/// Where players land on their very first join.
pub static FIRST_SPAWN: Lazy<DataKey<Location, GeneralData>> =
    Lazy::new(|| DataKey::of(["general", "first_spawn"]));

pub fn translator() -> DataTranslator<GeneralData> {
    DataTranslator::new(CONTENT_VERSION, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warps_skip_bad_entries() {
        let mut doc = translator()
            .from_external(
                br#"{
                    "warp": { "warps": {
                        "spawn": { "world": "minecraft:overworld", "x": 0.0, "y": 64.0, "z": 0.0 },
                        "broken": "somewhere"
                    } },
                    "content_version": 1
                }"#,
            )
            .unwrap();
        let warps = doc.get(&WARPS).unwrap();
        assert_eq!(warps.len(), 1);
        assert!(warps.contains_key("spawn"));
        assert_eq!(doc.get(&FIRST_SPAWN), None);
    }
}
