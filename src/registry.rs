//! Authoritative registry of placed 3D objects.
//!
//! One JSON list on disk plus an in-memory mirror. All reads and writes go
//! through a single mutex; persistence is temp-then-rename, so a reader of
//! the file races to either the previous or the new state, never a torn one.

use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact_store::atomic_write;
use crate::error::GenResult;
use crate::stage::epoch_secs;
use crate::tile_store::TileCoord;
use crate::understand::{Attributes, SizeClass};

/// Quality tier of an installed asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Light,
    Refined,
    Fallback,
}

/// One placed object in the 3D world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedObject {
    pub id: String,
    pub tile: TileCoord,
    /// World position `[wx, wy, wz]`.
    pub world: [f64; 3],
    pub rotation: [f64; 3],
    pub scale: f64,
    pub asset_url: String,
    pub quality: Quality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    pub created_at: u64,
}

impl PlacedObject {
    /// Registry id for a tile: `tile_<x>_<y>`.
    pub fn id_for(tile: TileCoord) -> String {
        format!("tile_{}_{}", tile.0, tile.1)
    }

    /// Deterministic world placement: `wx = x·s`, `wz = y·s`, `wy = 0`.
    pub fn world_for(tile: TileCoord, tile_scale: f64) -> [f64; 3] {
        [tile.0 as f64 * tile_scale, 0.0, tile.1 as f64 * tile_scale]
    }

    pub fn new(
        tile: TileCoord,
        tile_scale: f64,
        size: SizeClass,
        asset_url: String,
        quality: Quality,
        attributes: Option<Attributes>,
    ) -> Self {
        Self {
            id: Self::id_for(tile),
            tile,
            world: Self::world_for(tile, tile_scale),
            rotation: [0.0, 0.0, 0.0],
            scale: size.scale(),
            asset_url,
            quality,
            attributes,
            created_at: epoch_secs(),
        }
    }
}

/// Owner of the registry file and its in-memory mirror.
pub struct ObjectRegistry {
    path: PathBuf,
    objects: Mutex<Vec<PlacedObject>>,
}

impl ObjectRegistry {
    /// Open (or create) the registry at `path`, loading any existing list.
    pub fn open(path: PathBuf) -> GenResult<Self> {
        let objects = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            path,
            objects: Mutex::new(objects),
        })
    }

    /// Register an object, replacing any prior entry with the same id.
    ///
    /// The mutex is held across the disk write: a successful return means a
    /// subsequent `load` in this process observes the new entry, and
    /// concurrent registers serialize into a consistent file.
    pub fn register(&self, object: PlacedObject) -> GenResult<()> {
        let mut objects = self.objects.lock();
        objects.retain(|o| o.id != object.id);
        debug!(id = %object.id, quality = ?object.quality, "registering object");
        objects.push(object);
        atomic_write(&self.path, &serde_json::to_vec_pretty(&*objects)?)
    }

    /// Defensive copy of the current registry contents.
    pub fn load(&self) -> Vec<PlacedObject> {
        self.objects.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<PlacedObject> {
        self.objects.lock().iter().find(|o| o.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}
