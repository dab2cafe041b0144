//! Atlas - the persisted unit of a mapping session.
//!
//! The Atlas owns everything a map needs to be reused later:
//! - The [`Map`] (keyframes, landmarks, pose-graph edges)
//! - The [`Vocabulary`] used for place recognition
//! - The [`CalibratedCamera`] the map was built with
//!
//! KeyFrames enter and leave the map and the vocabulary together so that
//! the descriptor-length invariant is checked once, before either changes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, NewKeyFrame};
use crate::error::{Result, SlamError};
use crate::tracking::frame::CalibratedCamera;
use crate::vocabulary::{Vocabulary, VocabularyConfig};

/// Map, vocabulary and calibration of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atlas {
    map: Map,
    vocabulary: Vocabulary,
    camera: CalibratedCamera,
}

impl Atlas {
    /// Create an empty Atlas for `descriptor_len`-byte descriptors.
    pub fn new(camera: CalibratedCamera, descriptor_len: usize, vocabulary: VocabularyConfig) -> Result<Self> {
        camera.validate()?;
        Ok(Self {
            map: Map::new(descriptor_len),
            vocabulary: Vocabulary::new(vocabulary, descriptor_len)?,
            camera,
        })
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut Map {
        &mut self.map
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn camera(&self) -> &CalibratedCamera {
        &self.camera
    }

    pub fn descriptor_len(&self) -> usize {
        self.map.descriptor_len()
    }

    /// Bumped whenever a batch of corrected poses is applied.
    pub fn generation(&self) -> u64 {
        self.map.generation()
    }

    pub fn num_keyframes(&self) -> usize {
        self.map.num_keyframes()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert a KeyFrame into the map and index its descriptors.
    pub fn insert_keyframe(&mut self, new: NewKeyFrame) -> Result<KeyFrameId> {
        let found = new.features.descriptors.descriptor_len();
        if found != self.descriptor_len() && !new.features.is_empty() {
            return Err(SlamError::DescriptorLengthMismatch {
                expected: self.descriptor_len(),
                found,
            });
        }
        let descriptors = new.features.descriptors.clone();
        let id = self.map.insert_keyframe(new)?;
        self.vocabulary.add_descriptors(id, &descriptors)?;
        debug!("atlas: inserted {} ({} keyframes)", id, self.map.num_keyframes());
        Ok(id)
    }

    /// Remove a KeyFrame from the map and retire it from place recognition.
    pub fn remove_keyframe(&mut self, id: KeyFrameId) -> bool {
        if !self.map.remove_keyframe_full(id) {
            return false;
        }
        self.vocabulary.retire(id);
        true
    }

    /// Check map invariants and that map, vocabulary and camera agree.
    pub fn check_integrity(&self) -> Result<()> {
        self.camera.validate()?;
        if self.vocabulary.descriptor_len() != self.map.descriptor_len() {
            return Err(SlamError::MapFormat(format!(
                "vocabulary uses {}-byte descriptors, map uses {}",
                self.vocabulary.descriptor_len(),
                self.map.descriptor_len()
            )));
        }
        for kf in self.map.keyframes() {
            if !self.vocabulary.contains(kf.id) {
                return Err(SlamError::MapFormat(format!("{} missing from vocabulary", kf.id)));
            }
        }
        self.map.check_integrity()
    }
}
