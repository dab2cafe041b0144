//! Finished maps by id, for the query boundary.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use parking_lot::RwLock;
use tracing::info;

use crate::atlas::Atlas;
use crate::error::{Result, SlamError};
use crate::io::persistence;

use super::relocalizer::{Localization, Relocalizer};

/// Read-only maps shared between concurrent queries.
pub struct MapRegistry {
    maps: RwLock<HashMap<String, Arc<Atlas>>>,
    relocalizer: Relocalizer,
}

impl MapRegistry {
    pub fn new(relocalizer: Relocalizer) -> Self {
        Self {
            maps: RwLock::new(HashMap::new()),
            relocalizer,
        }
    }

    /// Register `atlas` under `map_id`, replacing any previous map.
    pub fn insert(&self, map_id: impl Into<String>, atlas: Atlas) -> Arc<Atlas> {
        let atlas = Arc::new(atlas);
        let map_id = map_id.into();
        info!("[MapRegistry] registered '{}' ({} keyframes)", map_id, atlas.num_keyframes());
        self.maps.write().insert(map_id, atlas.clone());
        atlas
    }

    /// Import a persisted map and register it.
    pub fn load_file(&self, map_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Arc<Atlas>> {
        let atlas = persistence::import_map_file(path)?;
        Ok(self.insert(map_id, atlas))
    }

    pub fn get(&self, map_id: &str) -> Option<Arc<Atlas>> {
        self.maps.read().get(map_id).cloned()
    }

    pub fn remove(&self, map_id: &str) -> Option<Arc<Atlas>> {
        self.maps.write().remove(map_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.maps.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Relocalize `images` against the map registered as `map_id`.
    ///
    /// The registry lock is released before matching so queries against
    /// the same or different maps run in parallel.
    pub fn localize(&self, map_id: &str, images: &[RgbImage]) -> Result<Localization> {
        let atlas = self.get(map_id).ok_or_else(|| SlamError::UnknownMap(map_id.to_string()))?;
        self.relocalizer.localize(&atlas, images)
    }
}
