//! # Document Definitions
//!
//! The document kinds the server persists, with their data keys and content
//! migrations. Feature code reads and writes through the `static` keys in the
//! submodules, for example:
//!
//! ```rust
//! use essentials_storage::documents::user;
//! use essentials_storage::KeyedDataObject;
//!
//! let mut doc = user::translator().create_new();
//! doc.set(&user::NICKNAME, "Steve".to_string());
//! assert_eq!(doc.get(&user::NICKNAME).as_deref(), Some("Steve"));
//! # let _: &KeyedDataObject<user::UserData> = &doc;
//! ```

pub mod general;
pub mod kit;
pub mod user;
pub mod world;

use serde::{Deserialize, Serialize};

pub use general::GeneralData;
pub use kit::{KitData, KitDefinition};
pub use user::UserData;
pub use world::WorldData;

/// A position in a world, stored by homes, warps and spawn points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// World key in `namespace:value` form.
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    pub fn with_rotation(mut self, yaw: f32, pitch: f32) -> Self {
        self.yaw = yaw;
        self.pitch = pitch;
        self
    }
}
