//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Each MapPoint tracks which KeyFrames observe it (with the pixel of each
//! observation), keeps quality counters for culling and stores a
//! representative descriptor for appearance matching.

use std::collections::BTreeMap;

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::types::{KeyFrameId, MapPointId};

/// How a landmark was first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LandmarkOrigin {
    /// Two-view triangulation with sufficient parallax.
    Triangulated,
    /// Single-view back-projection of a valid depth reading.
    DepthBackProjected,
}

/// One keyframe's view of a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub feature_idx: usize,
    /// Undistorted pixel location.
    pub pixel: Vector2<f64>,
}

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor (the most central observation).
    pub descriptor: Vec<u8>,

    /// Observing KeyFrames. Never empty for a point that is in the map.
    pub observations: BTreeMap<KeyFrameId, Observation>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// RGB sampled at the creating observation.
    pub color: [u8; 3],

    pub origin: LandmarkOrigin,

    /// Reference KeyFrame: pose corrections of this keyframe move the point
    /// rigidly. Always one of the observers.
    pub anchor_kf: KeyFrameId,

    /// Number of times this point was predicted visible in a tracked frame.
    pub visible_count: u32,

    /// Number of times this point was successfully matched.
    pub found_count: u32,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Vec<u8>,
        anchor_kf: KeyFrameId,
        origin: LandmarkOrigin,
        color: [u8; 3],
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: BTreeMap::new(),
            normal: Vector3::zeros(),
            color,
            origin,
            anchor_kf,
            visible_count: 0,
            found_count: 0,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize, pixel: Vector2<f64>) {
        self.observations.insert(kf_id, Observation { feature_idx, pixel });
    }

    /// Returns true if the observation existed and was removed.
    ///
    /// If the anchor is removed, the oldest remaining observer takes over.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        let removed = self.observations.remove(&kf_id).is_some();
        if removed && self.anchor_kf == kf_id {
            if let Some((&first, _)) = self.observations.iter().next() {
                self.anchor_kf = first;
            }
        }
        removed
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// found_count / visible_count; 1.0 before the point was ever predicted.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self) {
        self.visible_count += 1;
    }

    pub fn increase_found(&mut self) {
        self.found_count += 1;
    }

    /// A point is bad if it has too few observations or its found ratio is
    /// too low.
    pub fn should_cull(&self, min_found_ratio: f64, min_observations: usize) -> bool {
        self.num_observations() < min_observations || self.found_ratio() < min_found_ratio
    }

    /// Recompute the mean viewing direction from observer centres.
    pub fn update_normal<'a>(&mut self, kf_centers: impl Iterator<Item = &'a Vector3<f64>>) {
        let mut normal_sum = Vector3::zeros();
        for center in kf_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
            }
        }
        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            Vector3::new(1.0, 2.0, 3.0),
            vec![0; 32],
            KeyFrameId::new(1),
            LandmarkOrigin::Triangulated,
            [10, 20, 30],
        )
    }

    #[test]
    fn test_add_remove_observation() {
        let mut mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(1), 5, Vector2::new(1.0, 2.0));
        mp.add_observation(KeyFrameId::new(2), 10, Vector2::new(3.0, 4.0));
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observations[&KeyFrameId::new(1)].feature_idx, 5);

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert_eq!(mp.num_observations(), 1);
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
    }

    #[test]
    fn test_anchor_moves_to_remaining_observer() {
        let mut mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(1), 0, Vector2::zeros());
        mp.add_observation(KeyFrameId::new(4), 0, Vector2::zeros());
        mp.add_observation(KeyFrameId::new(3), 0, Vector2::zeros());
        mp.erase_observation(KeyFrameId::new(1));
        assert_eq!(mp.anchor_kf, KeyFrameId::new(3));
    }

    #[test]
    fn test_found_ratio() {
        let mut mp = create_test_mappoint();
        assert_eq!(mp.found_ratio(), 1.0);
        mp.visible_count = 3;
        mp.found_count = 2;
        assert!((mp.found_ratio() - 0.6667).abs() < 0.01);
    }

    #[test]
    fn test_should_cull() {
        let mut mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(1), 0, Vector2::zeros());
        mp.add_observation(KeyFrameId::new(2), 0, Vector2::zeros());
        assert!(mp.should_cull(0.25, 3));

        mp.add_observation(KeyFrameId::new(3), 0, Vector2::zeros());
        assert!(!mp.should_cull(0.25, 3));

        mp.visible_count = 100;
        mp.found_count = 10;
        assert!(mp.should_cull(0.25, 3));
        mp.found_count = 30;
        assert!(!mp.should_cull(0.25, 3));
    }

    #[test]
    fn test_update_normal() {
        let mut mp = create_test_mappoint();
        mp.position = Vector3::new(0.0, 0.0, 5.0);
        let centers = [Vector3::new(-1.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)];
        mp.update_normal(centers.iter());
        assert!((mp.normal - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-9);
    }
}
