//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the nodes of the pose graph. They contain:
//! - Features (keypoints, descriptors, per-keypoint depth and colour)
//! - Pose estimate (SE3 transform, camera-to-world)
//! - Graph relationships (odometry chain, covisibility)
//!
//! The covisibility graph connects KeyFrames that share MapPoint
//! observations; the odometry chain links KeyFrames in creation order.

use std::collections::HashMap;

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::tracking::frame::{Descriptors, KeyPoint};

use super::types::{KeyFrameId, MapPointId};

/// Stride-subsampled depth and colour kept for dense export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseSample {
    /// Sampling stride in colour pixels.
    pub stride: u32,
    /// Samples per row and per column.
    pub width: u32,
    pub height: u32,
    /// Depth in millimetres, row-major, 0 = invalid.
    pub depth_mm: Vec<u16>,
    /// RGB per sample, row-major.
    pub rgb: Vec<[u8; 3]>,
}

impl DenseSample {
    /// Colour pixel of sample (i, j).
    pub fn pixel(&self, i: u32, j: u32) -> Vector2<f64> {
        Vector2::new((i * self.stride) as f64, (j * self.stride) as f64)
    }

    pub fn len(&self) -> usize {
        self.depth_mm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth_mm.is_empty()
    }
}

/// A KeyFrame in the SLAM map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,

    pub descriptors: Descriptors,

    /// Metric depth per keypoint from the depth sensor. `None` where the
    /// frame had no depth or the reading was invalid.
    pub depths: Vec<Option<f64>>,

    /// Colour under each keypoint.
    pub colors: Vec<[u8; 3]>,

    /// Dense depth sample for point-cloud export (depth frames only).
    pub dense: Option<DenseSample>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Odometry chain
    // ─────────────────────────────────────────────────────────────────────────
    pub prev_kf: Option<KeyFrameId>,
    pub next_kf: Option<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,
}

impl KeyFrame {
    /// Create a KeyFrame with no map associations.
    ///
    /// `depths` and `colors` may be empty, in which case they are filled
    /// with "unknown" entries.
    pub fn new(
        id: KeyFrameId,
        timestamp_ns: u64,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        descriptors: Descriptors,
        mut depths: Vec<Option<f64>>,
        mut colors: Vec<[u8; 3]>,
    ) -> Self {
        let n = keypoints.len();
        depths.resize(n, None);
        colors.resize(n, [128, 128, 128]);
        Self {
            id,
            timestamp_ns,
            pose,
            keypoints,
            descriptors,
            depths,
            colors,
            dense: None,
            map_point_ids: vec![None; n],
            prev_kf: None,
            next_kf: None,
            covisibility_weights: HashMap::new(),
        }
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-camera transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    pub fn has_depth(&self) -> bool {
        self.depths.iter().any(|d| d.is_some())
    }

    pub fn pixel(&self, feature_idx: usize) -> Vector2<f64> {
        self.keypoints[feature_idx].pt()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Returns the previous association at this index, if any.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// (feature index, MapPoint) pairs of all associated features.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(i, mp)| mp.map(|id| (i, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|m| m.is_some()).count()
    }

    /// Feature indices within `radius` pixels of (u, v).
    pub fn get_features_in_area(&self, u: f64, v: f64, radius: f64) -> Vec<usize> {
        let r2 = radius * radius;
        self.keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| {
                let du = kp.x as f64 - u;
                let dv = kp.y as f64 - v;
                du * du + dv * dv <= r2
            })
            .map(|(i, _)| i)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility_weights.remove(&kf_id);
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// The N best covisible KeyFrames (most shared points first, ties by id).
    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        let mut ordered: Vec<(KeyFrameId, usize)> =
            self.covisibility_weights.iter().map(|(&k, &w)| (k, w)).collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.into_iter().take(n).map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kp(x: f32, y: f32) -> KeyPoint {
        KeyPoint { x, y, level: 0, angle: 0.0, response: 1.0 }
    }

    fn sample_keyframe() -> KeyFrame {
        let kps = vec![kp(10.0, 10.0), kp(12.0, 11.0), kp(100.0, 100.0)];
        let desc = Descriptors::from_rows(32, &[[0u8; 32], [1u8; 32], [2u8; 32]]).unwrap();
        KeyFrame::new(KeyFrameId(0), 0, SE3::identity(), kps, desc, Vec::new(), Vec::new())
    }

    #[test]
    fn test_new_fills_per_feature_vectors() {
        let kf = sample_keyframe();
        assert_eq!(kf.depths.len(), 3);
        assert_eq!(kf.colors.len(), 3);
        assert!(!kf.has_depth());
        assert_eq!(kf.num_map_points(), 0);
    }

    #[test]
    fn test_map_point_slots() {
        let mut kf = sample_keyframe();
        assert_eq!(kf.set_map_point(1, MapPointId(7)), None);
        assert_eq!(kf.set_map_point(1, MapPointId(8)), Some(MapPointId(7)));
        assert_eq!(kf.get_map_point(1), Some(MapPointId(8)));
        assert_eq!(kf.set_map_point(9, MapPointId(1)), None);
        assert_eq!(kf.erase_map_point(1), Some(MapPointId(8)));
        assert_eq!(kf.num_map_points(), 0);
    }

    #[test]
    fn test_features_in_area() {
        let kf = sample_keyframe();
        assert_eq!(kf.get_features_in_area(11.0, 10.0, 3.0), vec![0, 1]);
    }

    #[test]
    fn test_best_covisibles_order() {
        let mut kf = sample_keyframe();
        kf.add_covisibility(KeyFrameId(3), 5);
        kf.add_covisibility(KeyFrameId(1), 20);
        kf.add_covisibility(KeyFrameId(2), 5);
        kf.add_covisibility(KeyFrameId(0), 99);
        assert_eq!(kf.get_best_covisibles(2), vec![KeyFrameId(1), KeyFrameId(2)]);
    }
}
