//! Per-world documents.

use super::Location;
use crate::key::{DataKey, DocumentKind};
use crate::translator::DataTranslator;
use once_cell::sync::Lazy;

pub struct WorldData;

impl DocumentKind for WorldData {
    const NAME: &'static str = "world";
}

pub const CONTENT_VERSION: u32 = 1;

pub static SPAWN: Lazy<DataKey<Location, WorldData>> = Lazy::new(|| DataKey::of(["world", "spawn"]));

pub static PVP: Lazy<DataKey<bool, WorldData>> =
    Lazy::new(|| DataKey::of(["world", "pvp"]).with_default(true));

/// Radius of the world border, in blocks.
pub static BORDER_RADIUS: Lazy<DataKey<f64, WorldData>> =
    Lazy::new(|| DataKey::of(["world", "border_radius"]));

pub fn translator() -> DataTranslator<WorldData> {
    DataTranslator::new(CONTENT_VERSION, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_keys() {
        let t = translator();
        let mut doc = t.create_new();
        assert_eq!(doc.get_or_default(&PVP), Some(true));

        doc.set(&SPAWN, Location::new("minecraft:overworld", 0.5, 70.0, 0.5).with_rotation(90.0, 0.0));
        doc.set(&BORDER_RADIUS, 5_000.0);

        let mut reloaded = t.from_external(&t.to_external(&doc).unwrap()).unwrap();
        assert_eq!(reloaded.get(&SPAWN).unwrap().yaw, 90.0);
        assert_eq!(reloaded.get(&BORDER_RADIUS), Some(5_000.0));
    }
}
