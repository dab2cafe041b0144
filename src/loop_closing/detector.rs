//! Loop detection using the incremental vocabulary and absolute-pose
//! verification.
//!
//! Detection follows the three-phase locking pattern:
//! 1. COLLECT (read lock): BoW candidates for the keyframe, and a snapshot
//!    of each candidate's landmarks ([`LoopQuery`])
//! 2. VERIFY (no lock): descriptor matching + RANSAC PnP per candidate
//! 3. APPLY (write lock, in [`super::loop_closer`]): add the edge

use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::atlas::Atlas;
use crate::error::{Result, SlamError};
use crate::geometry::{Sim3, SE3};
use crate::tracking::frame::{CalibratedCamera, Descriptors};
use crate::tracking::matching::{DescriptorMatcher, PoseVerification};

/// Configuration for loop detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosingConfig {
    /// Most recent keyframes never considered as loop candidates.
    /// Default: 30
    pub exclude_recent: usize,

    /// Verified inliers required to accept a loop. Must be stricter than
    /// the tracking threshold.
    /// Default: 40
    pub min_inliers: usize,

    /// Best-scoring BoW candidates that are geometrically verified.
    /// Default: 5
    pub max_candidates: usize,

    /// Minimum BoW score for a candidate.
    /// Default: 0.01
    pub min_score: f64,

    /// Covisible keyframes of a candidate whose landmarks join the match.
    /// Default: 5
    pub covisible_neighbors: usize,
}

impl Default for LoopClosingConfig {
    fn default() -> Self {
        Self {
            exclude_recent: 30,
            min_inliers: 40,
            max_candidates: 5,
            min_score: 0.01,
            covisible_neighbors: 5,
        }
    }
}

impl LoopClosingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_candidates == 0 {
            return Err(SlamError::Config("loop_closing.max_candidates must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.min_score) {
            return Err(SlamError::Config("loop_closing.min_score must be in [0, 1)".into()));
        }
        Ok(())
    }
}

/// A potential loop closure candidate.
#[derive(Debug, Clone)]
pub struct LoopCandidate {
    /// Loop keyframe ID (the older keyframe we're closing back to).
    pub loop_kf_id: KeyFrameId,
    /// BoW similarity between the query and the loop keyframe.
    pub bow_score: f64,
    /// Landmarks of the loop keyframe and its covisible neighbours.
    pub landmarks: LandmarkSet,
    /// Pose of the loop keyframe at collection time (T_wc).
    pub loop_pose: SE3,
}

/// An accepted loop closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopClosure {
    /// The new keyframe that revisited a place.
    pub query_kf: KeyFrameId,
    /// The older keyframe it was matched to.
    pub loop_kf: KeyFrameId,
    pub bow_score: f64,
    pub num_matches: usize,
    pub num_inliers: usize,
    /// Relative transform loop -> query: T_w,loop⁻¹ ∘ T_w,query(estimated).
    pub measurement: Sim3,
    /// Edge residual (metres, radians) against the poses at detection time.
    pub residual_before: (f64, f64),
}

// ─────────────────────────────────────────────────────────────────────────────
// Landmark snapshots
// ─────────────────────────────────────────────────────────────────────────────

/// Positions and representative descriptors of a set of landmarks.
#[derive(Debug, Clone, Default)]
pub struct LandmarkSet {
    pub ids: Vec<MapPointId>,
    pub positions: Vec<Vector3<f64>>,
    pub descriptors: Descriptors,
}

impl LandmarkSet {
    /// Landmarks observed by the given keyframes.
    pub fn gather(map: &Map, kf_ids: &[KeyFrameId]) -> Self {
        let mut set = Self {
            descriptors: Descriptors::new(map.descriptor_len()),
            ..Self::default()
        };
        for mp_id in map.map_points_from_keyframes(kf_ids) {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if set.descriptors.push(&mp.descriptor).is_ok() {
                set.ids.push(mp_id);
                set.positions.push(mp.position);
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Match a query image's features against landmarks and verify them with
/// RANSAC PnP. Match `a` indexes the query features, `b` the landmarks.
pub fn match_and_verify(
    pixels: &[Vector2<f64>],
    descriptors: &Descriptors,
    landmarks: &LandmarkSet,
    matcher: &DescriptorMatcher,
    camera: &CalibratedCamera,
    min_inliers: usize,
) -> Result<PoseVerification> {
    if landmarks.is_empty() || descriptors.is_empty() {
        return Err(SlamError::InsufficientMatches {
            found: 0,
            required: min_inliers,
        });
    }
    let matches = matcher.match_descriptors(descriptors, &landmarks.descriptors)?;
    matcher.verify_absolute_pose(pixels, &landmarks.positions, &matches, camera, min_inliers)
}

// ─────────────────────────────────────────────────────────────────────────────
// Detection
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to verify loop candidates without holding the lock.
#[derive(Debug, Clone)]
pub struct LoopQuery {
    pub query_kf: KeyFrameId,
    /// Pose of the query keyframe at collection time (T_wc).
    pub query_pose: SE3,
    pub pixels: Vec<Vector2<f64>>,
    pub descriptors: Descriptors,
    pub candidates: Vec<LoopCandidate>,
}

/// Collect BoW candidates for a keyframe.
///
/// Excludes the `exclude_recent` most recent keyframes and every keyframe
/// covisible with or adjacent to the query. Returns None when there is
/// no candidate.
pub fn collect_loop_query(atlas: &Atlas, kf_id: KeyFrameId, config: &LoopClosingConfig) -> Option<LoopQuery> {
    let map = atlas.map();
    let kf = map.get_keyframe(kf_id)?;
    let bow = atlas.vocabulary().bow_of(kf_id)?;

    let mut connected: HashSet<KeyFrameId> = kf.covisibility_weights().keys().copied().collect();
    connected.insert(kf_id);
    connected.extend(kf.prev_kf);
    connected.extend(kf.next_kf);

    let candidates: Vec<LoopCandidate> = atlas
        .vocabulary()
        .query_bow(&bow, config.exclude_recent)
        .into_iter()
        .filter(|(id, score)| !connected.contains(id) && *score >= config.min_score)
        .take(config.max_candidates)
        .filter_map(|(id, bow_score)| {
            let loop_kf = map.get_keyframe(id)?;
            let mut group = loop_kf.get_best_covisibles(config.covisible_neighbors);
            group.retain(|g| !connected.contains(g));
            group.push(id);
            Some(LoopCandidate {
                loop_kf_id: id,
                bow_score,
                landmarks: LandmarkSet::gather(map, &group),
                loop_pose: loop_kf.pose.clone(),
            })
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }

    Some(LoopQuery {
        query_kf: kf_id,
        query_pose: kf.pose.clone(),
        pixels: kf.keypoints.iter().map(|kp| kp.pt()).collect(),
        descriptors: kf.descriptors.clone(),
        candidates,
    })
}

/// Verify every candidate and keep the best-scoring one that passes.
///
/// Fails with `NoLoopClosure` when no candidate reaches `min_inliers`.
pub fn verify_loop_query(
    query: &LoopQuery,
    matcher: &DescriptorMatcher,
    camera: &CalibratedCamera,
    config: &LoopClosingConfig,
) -> Result<LoopClosure> {
    let mut best: Option<LoopClosure> = None;
    for candidate in &query.candidates {
        let verified = match match_and_verify(
            &query.pixels,
            &query.descriptors,
            &candidate.landmarks,
            matcher,
            camera,
            config.min_inliers,
        ) {
            Ok(v) => v,
            Err(e) => {
                debug!(
                    "[LoopDetect] {} -> {} rejected: {}",
                    query.query_kf, candidate.loop_kf_id, e
                );
                continue;
            }
        };
        let measurement = Sim3::from_se3(&candidate.loop_pose.between(&verified.pose));
        let predicted = Sim3::from_se3(&candidate.loop_pose.between(&query.query_pose));
        let err = measurement.inverse().compose(&predicted);
        let closure = LoopClosure {
            query_kf: query.query_kf,
            loop_kf: candidate.loop_kf_id,
            bow_score: candidate.bow_score,
            num_matches: verified.num_matches,
            num_inliers: verified.inliers.len(),
            measurement,
            residual_before: (err.translation.norm(), err.rotation.angle()),
        };
        if best.as_ref().map_or(true, |b| closure.bow_score > b.bow_score) {
            best = Some(closure);
        }
    }
    best.ok_or(SlamError::NoLoopClosure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::NewKeyFrame;
    use crate::tracking::frame::{FeatureSet, KeyPoint};
    use crate::vocabulary::VocabularyConfig;
    use crate::tracking::matching::MatcherConfig;
    use nalgebra::UnitQuaternion;

    fn camera() -> CalibratedCamera {
        CalibratedCamera::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240)
    }

    fn descriptor(seed: usize) -> [u8; 32] {
        let mut d = [0u8; 32];
        let mut x = (seed as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        for b in d.iter_mut() {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            *b = x as u8;
        }
        d
    }

    /// 60 landmarks spread over a wall 3 m ahead, plus `tag`-specific
    /// clutter so keyframes of different places do not match.
    fn place(tag: usize) -> Vec<(Vector3<f64>, [u8; 32])> {
        let mut out = Vec::new();
        for i in 0..10 {
            for j in 0..6 {
                let p = Vector3::new(-1.5 + 0.33 * i as f64, -1.0 + 0.4 * j as f64, 3.0 + 0.2 * ((i * j) % 3) as f64);
                out.push((p, descriptor(tag * 1000 + i * 10 + j)));
            }
        }
        out
    }

    fn keyframe(pose: &SE3, points: &[(Vector3<f64>, [u8; 32])]) -> NewKeyFrame {
        let cam = camera();
        let mut kps = Vec::new();
        let mut rows = Vec::new();
        let mut depths = Vec::new();
        for (p, d) in points {
            let pc = pose.inverse().transform_point(p);
            if let Some(uv) = cam.project(&pc).filter(|uv| cam.in_image(uv, 0.0)) {
                kps.push(KeyPoint { x: uv.x as f32, y: uv.y as f32, level: 0, angle: 0.0, response: 1.0 });
                rows.push(*d);
                depths.push(Some(pc.z));
            }
        }
        let n = kps.len();
        NewKeyFrame {
            timestamp_ns: 0,
            pose: pose.clone(),
            features: FeatureSet { keypoints: kps, descriptors: Descriptors::from_rows(32, &rows).unwrap() },
            depths,
            colors: vec![[0, 0, 0]; n],
            dense: None,
        }
    }

    /// Place 0 mapped by keyframe 0, then `others` keyframes of unrelated
    /// places, then a revisit of place 0 with a drifted pose.
    fn atlas_with_revisit(others: usize, drift: &SE3) -> (Atlas, KeyFrameId) {
        let mut atlas = Atlas::new(camera(), 32, VocabularyConfig::default()).unwrap();
        let origin = SE3::identity();
        let kf0 = atlas.insert_keyframe(keyframe(&origin, &place(0))).unwrap();
        for i in 0..atlas.map().get_keyframe(kf0).unwrap().num_features() {
            crate::local_mapping::back_project_depth(
                atlas.map_mut(),
                &camera(),
                kf0,
                i,
                &crate::tracking::tracking_frame::DepthConfig::default(),
            )
            .unwrap();
        }
        for k in 0..others {
            let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(0.5 * (k + 1) as f64, 0.0, 0.0));
            atlas.insert_keyframe(keyframe(&pose, &place(k + 1))).unwrap();
        }
        // The revisit's features are those of place 0 seen from the origin,
        // but tracking reports a drifted pose.
        let mut revisit = keyframe(&origin, &place(0));
        revisit.pose = drift.clone();
        let q = atlas.insert_keyframe(revisit).unwrap();
        (atlas, q)
    }

    #[test]
    fn test_revisit_is_detected_and_measured() {
        let drift = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0), Vector3::new(0.15, 0.0, 0.05));
        let (atlas, q) = atlas_with_revisit(6, &drift);
        let config = LoopClosingConfig { exclude_recent: 3, ..LoopClosingConfig::default() };
        let query = collect_loop_query(&atlas, q, &config).unwrap();
        assert_eq!(query.candidates[0].loop_kf_id, KeyFrameId(0));

        let matcher = DescriptorMatcher::new(MatcherConfig::default());
        let closure = verify_loop_query(&query, &matcher, &camera(), &config).unwrap();
        assert_eq!(closure.loop_kf, KeyFrameId(0));
        assert!(closure.num_inliers >= 40);
        // True relative pose is identity.
        assert!(closure.measurement.translation.norm() < 0.01);
        assert!(closure.measurement.rotation.angle() < 1e-3);
        assert!(closure.residual_before.0 > 0.1);
    }

    #[test]
    fn test_recent_keyframes_are_excluded() {
        let (atlas, q) = atlas_with_revisit(2, &SE3::identity());
        let config = LoopClosingConfig { exclude_recent: 30, ..LoopClosingConfig::default() };
        assert!(collect_loop_query(&atlas, q, &config).is_none());
    }

    #[test]
    fn test_weak_candidate_fails_with_no_loop_closure() {
        let (atlas, q) = atlas_with_revisit(6, &SE3::identity());
        let config = LoopClosingConfig { exclude_recent: 3, min_inliers: 500, ..LoopClosingConfig::default() };
        let query = collect_loop_query(&atlas, q, &config).unwrap();
        let matcher = DescriptorMatcher::new(MatcherConfig::default());
        let err = verify_loop_query(&query, &matcher, &camera(), &config).unwrap_err();
        assert!(matches!(err, SlamError::NoLoopClosure));
    }

    #[test]
    fn test_empty_landmarks_do_not_verify() {
        let matcher = DescriptorMatcher::new(MatcherConfig::default());
        let err = match_and_verify(&[], &Descriptors::new(32), &LandmarkSet::default(), &matcher, &camera(), 10)
            .unwrap_err();
        assert!(err.is_insufficient_data());
    }
}
