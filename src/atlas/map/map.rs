//! Map - Container for KeyFrames, MapPoints and pose-graph edges.
//!
//! The Map is the central data structure that holds the SLAM graph:
//! - KeyFrames with their poses and features, chained in creation order
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility relationships between KeyFrames
//! - Odometry and loop-closure edges
//!
//! It provides methods for:
//! - Adding/removing KeyFrames and MapPoints
//! - Creating bidirectional associations (KF↔MP)
//! - Querying local neighborhoods
//! - Applying a batch of pose corrections in one step

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SlamError};
use crate::geometry::{Sim3, SE3};
use crate::tracking::frame::FeatureSet;
use crate::tracking::matching::hamming;

use super::edge::{EdgeType, PoseGraphEdge};
use super::keyframe::{DenseSample, KeyFrame};
use super::map_point::{LandmarkOrigin, MapPoint};
use super::types::{KeyFrameId, MapPointId};

/// Information weight of odometry edges.
pub const ODOMETRY_INFORMATION: f64 = 1.0;

/// Everything needed to insert a KeyFrame.
#[derive(Debug, Clone)]
pub struct NewKeyFrame {
    pub timestamp_ns: u64,
    /// Camera-to-world pose from tracking.
    pub pose: SE3,
    pub features: FeatureSet,
    pub depths: Vec<Option<f64>>,
    pub colors: Vec<[u8; 3]>,
    pub dense: Option<DenseSample>,
}

/// The SLAM map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Map {
    keyframes: BTreeMap<KeyFrameId, KeyFrame>,
    map_points: BTreeMap<MapPointId, MapPoint>,
    edges: Vec<PoseGraphEdge>,

    next_kf_id: u64,
    next_mp_id: u64,

    /// Descriptor length shared by every keyframe and landmark.
    descriptor_len: usize,

    /// Tail of the odometry chain.
    last_keyframe_id: Option<KeyFrameId>,

    /// Incremented by every pose batch; lets readers detect corrections.
    generation: u64,
}

impl Map {
    pub fn new(descriptor_len: usize) -> Self {
        Self {
            keyframes: BTreeMap::new(),
            map_points: BTreeMap::new(),
            edges: Vec::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            descriptor_len,
            last_keyframe_id: None,
            generation: 0,
        }
    }

    pub fn descriptor_len(&self) -> usize {
        self.descriptor_len
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Management
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a KeyFrame at the end of the odometry chain.
    ///
    /// Adds the odometry edge from the previous KeyFrame. Fails without
    /// touching the map if the descriptor length differs from the map's.
    pub fn insert_keyframe(&mut self, new: NewKeyFrame) -> Result<KeyFrameId> {
        let found = new.features.descriptors.descriptor_len();
        if found != self.descriptor_len && !new.features.is_empty() {
            return Err(SlamError::DescriptorLengthMismatch {
                expected: self.descriptor_len,
                found,
            });
        }
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;

        let FeatureSet {
            keypoints,
            descriptors,
        } = new.features;
        let mut kf = KeyFrame::new(id, new.timestamp_ns, new.pose, keypoints, descriptors, new.depths, new.colors);
        kf.dense = new.dense;

        if let Some(prev_id) = self.last_keyframe_id {
            if let Some(prev) = self.keyframes.get_mut(&prev_id) {
                prev.next_kf = Some(id);
                kf.prev_kf = Some(prev_id);
                self.edges.push(PoseGraphEdge::between(
                    prev_id,
                    &prev.pose,
                    id,
                    &kf.pose,
                    ODOMETRY_INFORMATION,
                    EdgeType::Odometry,
                ));
            }
        }
        self.keyframes.insert(id, kf);
        self.last_keyframe_id = Some(id);
        Ok(id)
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    /// KeyFrames in creation order.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframes.keys()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Management
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a landmark observed by `kf_id` at `feature_idx`.
    ///
    /// The observing KeyFrame becomes the landmark's anchor and provides its
    /// descriptor and colour.
    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        kf_id: KeyFrameId,
        feature_idx: usize,
        origin: LandmarkOrigin,
    ) -> Result<MapPointId> {
        if !position.iter().all(|v| v.is_finite()) {
            return Err(SlamError::TriangulationFailed("non-finite position".into()));
        }
        let kf = self
            .keyframes
            .get(&kf_id)
            .ok_or_else(|| SlamError::TriangulationFailed(format!("{} not in map", kf_id)))?;
        if feature_idx >= kf.num_features() {
            return Err(SlamError::TriangulationFailed(format!(
                "feature {} out of range for {}",
                feature_idx, kf_id
            )));
        }
        if kf.get_map_point(feature_idx).is_some() {
            return Err(SlamError::TriangulationFailed(format!(
                "feature {} of {} already has a landmark",
                feature_idx, kf_id
            )));
        }
        let descriptor = kf.descriptors.row(feature_idx).to_vec();
        let color = kf.colors[feature_idx];
        let center = kf.camera_center();

        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        let mut mp = MapPoint::new(id, position, descriptor, kf_id, origin, color);
        mp.update_normal(std::iter::once(&center));
        self.map_points.insert(id, mp);
        self.associate(kf_id, feature_idx, id);
        Ok(id)
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn map_point_ids(&self) -> impl Iterator<Item = &MapPointId> {
        self.map_points.keys()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a
    /// MapPoint, updating covisibility with the point's other observers.
    ///
    /// Returns false if either side is missing, the feature slot is taken by
    /// another point, or the KeyFrame already observes this point.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.num_features() || kf.get_map_point(feature_idx).is_some() {
            return false;
        }
        let pixel = kf.pixel(feature_idx);
        let Some(mp) = self.map_points.get_mut(&mp_id) else {
            return false;
        };
        if mp.is_observed_by(kf_id) {
            return false;
        }
        let existing_observers: Vec<KeyFrameId> = mp.observations.keys().copied().collect();
        mp.add_observation(kf_id, feature_idx, pixel);

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }
        true
    }

    /// Remove the association of a KeyFrame feature.
    ///
    /// A landmark left without observations is deleted. Returns the
    /// MapPoint ID that was disassociated, if any.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.get_map_point(feature_idx)?;

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point(feature_idx);
        }
        let other_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.erase_observation(kf_id);
                mp.observations.keys().copied().collect()
            }
            None => Vec::new(),
        };

        for other_kf_id in &other_observers {
            self.decrement_covisibility(kf_id, *other_kf_id);
        }
        if other_observers.is_empty() {
            self.map_points.remove(&mp_id);
        }
        Some(mp_id)
    }

    fn decrement_covisibility(&mut self, a: KeyFrameId, b: KeyFrameId) {
        let current = self
            .keyframes
            .get(&b)
            .map(|kf| kf.get_covisibility_weight(a))
            .unwrap_or(0);
        for (x, y) in [(a, b), (b, a)] {
            if let Some(kf) = self.keyframes.get_mut(&x) {
                if current <= 1 {
                    kf.erase_covisibility(y);
                } else {
                    kf.add_covisibility(y, current - 1);
                }
            }
        }
    }

    /// Fully remove a MapPoint, cleaning up all associations.
    pub fn remove_map_point_full(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.iter().map(|(&k, o)| (k, o.feature_idx)).collect())
            .unwrap_or_default();

        for (i, &(kf_id, feat_idx)) in observations.iter().enumerate() {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_map_point(feat_idx);
            }
            for &(other, _) in &observations[i + 1..] {
                self.decrement_covisibility(kf_id, other);
            }
        }
        self.map_points.remove(&mp_id);
    }

    /// Fuse `remove` into `keep`: observations of `remove` move to `keep`
    /// where the KeyFrame does not already observe it.
    pub fn replace_map_point(&mut self, remove: MapPointId, keep: MapPointId) {
        if remove == keep {
            return;
        }
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get(&remove) {
            Some(mp) => mp.observations.iter().map(|(&k, o)| (k, o.feature_idx)).collect(),
            None => return,
        };
        self.remove_map_point_full(remove);
        for (kf_id, feat_idx) in observations {
            self.associate(kf_id, feat_idx, keep);
        }
    }

    /// Fully remove a KeyFrame.
    ///
    /// The odometry chain is relinked around it (composing the two odometry
    /// edges), loop edges are re-anchored on a chain neighbour, and
    /// landmarks left without observations are deleted.
    pub fn remove_keyframe_full(&mut self, kf_id: KeyFrameId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        let prev = kf.prev_kf;
        let next = kf.next_kf;
        let pose = kf.pose.clone();
        let associations: Vec<(usize, MapPointId)> = kf.get_map_point_indices().collect();

        for (feat_idx, _) in associations {
            self.disassociate(kf_id, feat_idx);
        }
        let covisibles: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.covisibility_weights().keys().copied().collect())
            .unwrap_or_default();
        for other in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }

        // Relink the chain.
        let in_edge = self
            .edges
            .iter()
            .find(|e| e.edge_type == EdgeType::Odometry && e.kf_id_j == kf_id)
            .cloned();
        let out_edge = self
            .edges
            .iter()
            .find(|e| e.edge_type == EdgeType::Odometry && e.kf_id_i == kf_id)
            .cloned();
        if let Some(p) = prev {
            if let Some(p_kf) = self.keyframes.get_mut(&p) {
                p_kf.next_kf = next;
            }
        }
        if let Some(n) = next {
            if let Some(n_kf) = self.keyframes.get_mut(&n) {
                n_kf.prev_kf = prev;
            }
        }
        if self.last_keyframe_id == Some(kf_id) {
            self.last_keyframe_id = prev;
        }

        // Re-anchor loop edges on the nearest surviving chain neighbour.
        let substitute = prev.or(next);
        let substitute_pose = substitute.and_then(|s| self.keyframes.get(&s)).map(|k| k.pose.clone());
        let mut edges = Vec::with_capacity(self.edges.len());
        for mut edge in std::mem::take(&mut self.edges) {
            if !edge.connects(kf_id) {
                edges.push(edge);
                continue;
            }
            if edge.edge_type == EdgeType::Odometry {
                continue;
            }
            let (Some(sub), Some(sub_pose)) = (substitute, substitute_pose.as_ref()) else {
                continue;
            };
            // T_sub,removed from the current estimate.
            let hop = Sim3::from_se3(&sub_pose.between(&pose));
            if edge.kf_id_i == kf_id {
                edge.kf_id_i = sub;
                edge.measurement = hop.compose(&edge.measurement);
            } else {
                edge.kf_id_j = sub;
                edge.measurement = edge.measurement.compose(&hop.inverse());
            }
            if edge.kf_id_i != edge.kf_id_j {
                edges.push(edge);
            }
        }
        if let (Some(p), Some(n), Some(a), Some(b)) = (prev, next, in_edge, out_edge) {
            edges.push(PoseGraphEdge {
                kf_id_i: p,
                kf_id_j: n,
                measurement: a.measurement.compose(&b.measurement),
                information: ODOMETRY_INFORMATION,
                edge_type: EdgeType::Odometry,
            });
        }
        self.edges = edges;
        self.keyframes.remove(&kf_id);
        debug!("removed {} ({} keyframes left)", kf_id, self.keyframes.len());
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pose Graph
    // ─────────────────────────────────────────────────────────────────────────

    pub fn edges(&self) -> &[PoseGraphEdge] {
        &self.edges
    }

    pub fn loop_edges(&self) -> impl Iterator<Item = &PoseGraphEdge> {
        self.edges.iter().filter(|e| e.edge_type == EdgeType::LoopClosure)
    }

    pub fn num_loop_edges(&self) -> usize {
        self.loop_edges().count()
    }

    /// Add a verified loop-closure edge. Loop edges are never removed.
    pub fn add_loop_edge(&mut self, edge: PoseGraphEdge) -> bool {
        if !self.keyframes.contains_key(&edge.kf_id_i) || !self.keyframes.contains_key(&edge.kf_id_j) {
            return false;
        }
        self.edges.push(PoseGraphEdge {
            edge_type: EdgeType::LoopClosure,
            ..edge
        });
        true
    }

    /// Apply new poses to a set of KeyFrames in one step.
    ///
    /// Each landmark moves rigidly with its anchor KeyFrame: the point is
    /// expressed in the anchor's old camera frame and mapped back through
    /// the new (possibly scaled) pose. Returns the number of updated
    /// KeyFrames.
    pub fn apply_pose_batch(&mut self, new_poses: &BTreeMap<KeyFrameId, Sim3>) -> usize {
        let old_poses: BTreeMap<KeyFrameId, SE3> = new_poses
            .keys()
            .filter_map(|id| self.keyframes.get(id).map(|kf| (*id, kf.pose.clone())))
            .collect();

        for mp in self.map_points.values_mut() {
            let (Some(old), Some(new)) = (old_poses.get(&mp.anchor_kf), new_poses.get(&mp.anchor_kf)) else {
                continue;
            };
            let p_cam = old.inverse().transform_point(&mp.position);
            mp.position = new.transform_point(&p_cam);
        }

        let mut updated = 0;
        for (id, pose) in new_poses {
            if let Some(kf) = self.keyframes.get_mut(id) {
                kf.pose = pose.to_se3();
                updated += 1;
            }
        }
        self.generation += 1;
        updated
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Covisible neighbourhood of a KeyFrame: its `n` best covisible
    /// KeyFrames plus its chain neighbours, without the KeyFrame itself.
    pub fn local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return Vec::new();
        };
        let mut out = kf.get_best_covisibles(n);
        for neighbour in [kf.prev_kf, kf.next_kf].into_iter().flatten() {
            if !out.contains(&neighbour) {
                out.push(neighbour);
            }
        }
        out
    }

    /// Most recent `n` KeyFrames, newest last.
    pub fn recent_keyframes(&self, n: usize) -> Vec<KeyFrameId> {
        let ids: Vec<KeyFrameId> = self.keyframes.keys().rev().take(n).copied().collect();
        ids.into_iter().rev().collect()
    }

    /// Distinct landmarks observed by the given KeyFrames.
    pub fn map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> Vec<MapPointId> {
        let set: BTreeSet<MapPointId> = kf_ids
            .iter()
            .filter_map(|id| self.keyframes.get(id))
            .flat_map(|kf| kf.get_map_point_indices().map(|(_, mp)| mp))
            .collect();
        set.into_iter().collect()
    }

    /// Landmarks of a KeyFrame observed by at least `min_obs` KeyFrames.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        self.keyframes.get(&kf_id).map_or(0, |kf| {
            kf.get_map_point_indices()
                .filter(|(_, mp)| {
                    self.map_points
                        .get(mp)
                        .map_or(false, |p| p.num_observations() >= min_obs)
                })
                .count()
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Pick the observation descriptor with the least median distance to the
    /// others as the landmark's representative.
    pub fn update_map_point_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let descriptors: Vec<&[u8]> = mp
            .observations
            .iter()
            .filter_map(|(kf_id, obs)| {
                self.keyframes
                    .get(kf_id)
                    .and_then(|kf| kf.descriptors.get(obs.feature_idx))
            })
            .collect();
        if descriptors.is_empty() {
            return;
        }
        let n = descriptors.len();
        let mut best = (u32::MAX, 0usize);
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n).map(|j| hamming(descriptors[i], descriptors[j])).collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best.0 {
                best = (median, i);
            }
        }
        let chosen = descriptors[best.1].to_vec();
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = chosen;
        }
    }

    /// Recompute a landmark's mean viewing direction.
    pub fn update_map_point_normal(&mut self, mp_id: MapPointId) {
        let centers: Vec<Vector3<f64>> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .keys()
                .filter_map(|id| self.keyframes.get(id).map(|kf| kf.camera_center()))
                .collect(),
            None => return,
        };
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal(centers.iter());
        }
    }

    /// Remove the given landmarks if they fail the quality test.
    pub fn cull_map_points(&mut self, candidates: &[MapPointId], min_found_ratio: f64, min_observations: usize) -> usize {
        let bad: Vec<MapPointId> = candidates
            .iter()
            .filter(|id| {
                self.map_points
                    .get(id)
                    .map_or(false, |mp| mp.should_cull(min_found_ratio, min_observations))
            })
            .copied()
            .collect();
        for id in &bad {
            self.remove_map_point_full(*id);
        }
        bad.len()
    }

    /// Check the structural invariants of the map.
    ///
    /// Every landmark has at least one observation, every observation is
    /// mirrored by its KeyFrame, anchors are observers, edges reference
    /// existing KeyFrames and all descriptors have the map's length.
    pub fn check_integrity(&self) -> Result<()> {
        let fail = |msg: String| Err(SlamError::MapFormat(msg));
        for mp in self.map_points.values() {
            if mp.observations.is_empty() {
                return fail(format!("{} has no observations", mp.id));
            }
            if !mp.observations.contains_key(&mp.anchor_kf) {
                return fail(format!("{} anchor {} is not an observer", mp.id, mp.anchor_kf));
            }
            if mp.descriptor.len() != self.descriptor_len {
                return fail(format!("{} descriptor has {} bytes", mp.id, mp.descriptor.len()));
            }
            for (kf_id, obs) in &mp.observations {
                let back = self.keyframes.get(kf_id).and_then(|kf| kf.get_map_point(obs.feature_idx));
                if back != Some(mp.id) {
                    return fail(format!("{} observation in {} is not mirrored", mp.id, kf_id));
                }
            }
        }
        for kf in self.keyframes.values() {
            if !kf.descriptors.is_empty() && kf.descriptors.descriptor_len() != self.descriptor_len {
                return fail(format!("{} has {}-byte descriptors", kf.id, kf.descriptors.descriptor_len()));
            }
            if kf.keypoints.len() != kf.descriptors.len() || kf.map_point_ids.len() != kf.keypoints.len() {
                return fail(format!("{} feature arrays disagree", kf.id));
            }
            for (_, mp_id) in kf.get_map_point_indices() {
                if !self.map_points.contains_key(&mp_id) {
                    return fail(format!("{} references missing {}", kf.id, mp_id));
                }
            }
        }
        for e in &self.edges {
            if !self.keyframes.contains_key(&e.kf_id_i) || !self.keyframes.contains_key(&e.kf_id_j) {
                return fail(format!("edge {}-{} references a missing keyframe", e.kf_id_i, e.kf_id_j));
            }
        }
        Ok(())
    }
}
