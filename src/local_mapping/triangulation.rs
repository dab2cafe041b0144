//! Landmark creation: two-view triangulation and depth back-projection.
//!
//! Two-view triangulation follows the usual keyframe-pair procedure:
//! 1. Collect features of both keyframes that have no landmark yet
//! 2. Match them by descriptor and keep pairs consistent with the epipolar
//!    geometry implied by the two known poses
//! 3. Triangulate with DLT and validate parallax, depth in both cameras and
//!    reprojection error
//!
//! Depth back-projection creates a landmark from one keyframe feature whose
//! sensor depth is valid and inside the trusted range.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::{KeyFrame, KeyFrameId, LandmarkOrigin, Map, MapPointId};
use crate::error::{Result, SlamError};
use crate::geometry::so3::skew;
use crate::geometry::two_view::sampson_sq;
use crate::geometry::{parallax_deg, triangulate_dlt, SE3};
use crate::tracking::frame::CalibratedCamera;
use crate::tracking::matching::{scaled_threshold, DescriptorMatcher, TH_LOW};
use crate::tracking::tracking_frame::DepthConfig;

/// Configuration for two-view triangulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Number of covisible keyframes paired with a new keyframe.
    /// Default: 10
    pub num_neighbors: usize,

    /// Minimum angle between the two viewing rays, degrees.
    /// Default: 1.0
    pub min_parallax_deg: f64,

    /// Squared reprojection error bound at pyramid level 0 (chi-squared,
    /// 2 DOF, 95%). Scaled by the level variance.
    /// Default: 5.991
    pub max_reproj_error_sq: f64,

    /// Maximum descriptor distance per 256 bits for triangulation matches.
    /// Default: 50
    pub max_descriptor_distance: u32,

    /// Minimum baseline as a fraction of the median scene depth.
    /// Default: 0.01
    pub min_baseline_ratio: f64,

    /// Squared epipolar (Sampson) bound in pixels at level 0
    /// (chi-squared, 1 DOF, 95%).
    /// Default: 3.84
    pub max_epipolar_error_sq: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            num_neighbors: 10,
            min_parallax_deg: 1.0,
            max_reproj_error_sq: 5.991,
            max_descriptor_distance: TH_LOW,
            min_baseline_ratio: 0.01,
            max_epipolar_error_sq: 3.84,
        }
    }
}

impl TriangulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_parallax_deg > 0.0 && self.min_parallax_deg < 90.0) {
            return Err(SlamError::Config(format!(
                "mapping.triangulation.min_parallax_deg must be in (0, 90), got {}",
                self.min_parallax_deg
            )));
        }
        if self.max_reproj_error_sq <= 0.0 || self.max_epipolar_error_sq <= 0.0 {
            return Err(SlamError::Config("triangulation error bounds must be positive".into()));
        }
        if self.num_neighbors == 0 {
            return Err(SlamError::Config("mapping.triangulation.num_neighbors must be positive".into()));
        }
        Ok(())
    }
}

/// Per-level measurement variance of keypoints extracted on a scale pyramid.
#[derive(Debug, Clone, Copy)]
pub struct LevelScale {
    scale_factor: f64,
}

impl LevelScale {
    pub fn new(scale_factor: f64) -> Self {
        Self { scale_factor }
    }

    /// Variance (pixels²) of a keypoint detected at `level`.
    pub fn sigma2(&self, level: u8) -> f64 {
        self.scale_factor.powi(2 * level as i32)
    }
}

/// Why a single correspondence did not produce a landmark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// Rays too close to parallel; carries the parallax in degrees.
    Parallax(f64),
    /// Point behind (or on) one of the cameras.
    Depth,
    /// Reprojection error above the bound in either view.
    Reprojection,
    /// DLT solution at infinity or not finite.
    Degenerate,
}

/// One view of a correspondence: camera pose (T_wc), undistorted pixel and
/// its measurement variance.
#[derive(Debug, Clone, Copy)]
pub struct View<'a> {
    pub pose: &'a SE3,
    pub pixel: Vector2<f64>,
    pub sigma2: f64,
}

/// Triangulate and validate one correspondence.
pub fn triangulate_point(
    a: View<'_>,
    b: View<'_>,
    camera: &CalibratedCamera,
    config: &TriangulationConfig,
) -> std::result::Result<Vector3<f64>, Rejection> {
    let pose_a_cw = a.pose.inverse();
    let pose_b_cw = b.pose.inverse();
    let xa = camera.normalized(a.pixel.x, a.pixel.y);
    let xb = camera.normalized(b.pixel.x, b.pixel.y);

    let point = triangulate_dlt(&pose_a_cw, &pose_b_cw, &xa, &xb).ok_or(Rejection::Degenerate)?;

    let parallax = parallax_deg(&a.pose.translation, &b.pose.translation, &point);
    if parallax < config.min_parallax_deg {
        return Err(Rejection::Parallax(parallax));
    }

    for (pose_cw, view) in [(&pose_a_cw, &a), (&pose_b_cw, &b)] {
        let p_cam = pose_cw.transform_point(&point);
        if p_cam.z <= 0.0 {
            return Err(Rejection::Depth);
        }
        let uv = camera.project(&p_cam).ok_or(Rejection::Depth)?;
        if (uv - view.pixel).norm_squared() > config.max_reproj_error_sq * view.sigma2 {
            return Err(Rejection::Reprojection);
        }
    }
    Ok(point)
}

/// Outcome of triangulating a batch of correspondences between two keyframes.
#[derive(Debug, Clone, Default)]
pub struct TriangulationOutcome {
    /// Landmarks created by this call.
    pub created: Vec<MapPointId>,
    /// Correspondences whose two features already share a landmark.
    pub existing: Vec<MapPointId>,
    /// Correspondences where only one side (or two different landmarks)
    /// was already associated.
    pub skipped: usize,
    pub rejected_parallax: usize,
    pub rejected_depth: usize,
    pub rejected_reprojection: usize,
    pub rejected_degenerate: usize,
    /// Largest parallax seen among parallax rejections, degrees.
    pub max_rejected_parallax_deg: f64,
}

impl TriangulationOutcome {
    pub fn num_rejected(&self) -> usize {
        self.rejected_parallax + self.rejected_depth + self.rejected_reprojection + self.rejected_degenerate
    }

    /// Landmarks covering the input correspondences, new and old.
    pub fn landmarks(&self) -> impl Iterator<Item = &MapPointId> {
        self.created.iter().chain(self.existing.iter())
    }
}

/// Create landmarks from verified correspondences `(feature in A, feature in B)`.
///
/// Calling this again with the same inputs creates nothing new: pairs whose
/// features already share a landmark are reported in `existing`. Fails with
/// `InsufficientParallax` when every fresh correspondence was rejected for
/// parallax, and with `TriangulationFailed` when none produced a landmark
/// for any other reason.
pub fn triangulate(
    map: &mut Map,
    camera: &CalibratedCamera,
    scale: LevelScale,
    kf_a: KeyFrameId,
    kf_b: KeyFrameId,
    correspondences: &[(usize, usize)],
    config: &TriangulationConfig,
) -> Result<TriangulationOutcome> {
    if kf_a == kf_b {
        return Err(SlamError::TriangulationFailed(format!("{} paired with itself", kf_a)));
    }
    let (pose_a, pose_b) = match (map.get_keyframe(kf_a), map.get_keyframe(kf_b)) {
        (Some(a), Some(b)) => (a.pose.clone(), b.pose.clone()),
        _ => {
            return Err(SlamError::TriangulationFailed(format!(
                "{} or {} not in map",
                kf_a, kf_b
            )))
        }
    };

    let mut outcome = TriangulationOutcome::default();
    for &(ia, ib) in correspondences {
        let (Some(view_a), Some(view_b)) = (
            feature_view(map, kf_a, &pose_a, ia, scale),
            feature_view(map, kf_b, &pose_b, ib, scale),
        ) else {
            outcome.skipped += 1;
            continue;
        };
        match (view_a.1, view_b.1) {
            (Some(x), Some(y)) if x == y => {
                outcome.existing.push(x);
                continue;
            }
            (None, None) => {}
            _ => {
                outcome.skipped += 1;
                continue;
            }
        }

        match triangulate_point(view_a.0, view_b.0, camera, config) {
            Ok(point) => {
                let id = map.create_map_point(point, kf_a, ia, LandmarkOrigin::Triangulated)?;
                map.associate(kf_b, ib, id);
                map.update_map_point_descriptor(id);
                map.update_map_point_normal(id);
                outcome.created.push(id);
            }
            Err(Rejection::Parallax(deg)) => {
                outcome.rejected_parallax += 1;
                outcome.max_rejected_parallax_deg = outcome.max_rejected_parallax_deg.max(deg);
            }
            Err(Rejection::Depth) => outcome.rejected_depth += 1,
            Err(Rejection::Reprojection) => outcome.rejected_reprojection += 1,
            Err(Rejection::Degenerate) => outcome.rejected_degenerate += 1,
        }
    }

    if outcome.created.is_empty() && outcome.existing.is_empty() {
        if outcome.rejected_parallax > 0 && outcome.rejected_parallax == outcome.num_rejected() {
            return Err(SlamError::InsufficientParallax {
                degrees: outcome.max_rejected_parallax_deg,
            });
        }
        return Err(SlamError::TriangulationFailed(format!(
            "{} correspondences between {} and {}: {} behind camera, {} reprojection, {} degenerate, {} skipped",
            correspondences.len(),
            kf_a,
            kf_b,
            outcome.rejected_depth,
            outcome.rejected_reprojection,
            outcome.rejected_degenerate,
            outcome.skipped
        )));
    }
    Ok(outcome)
}

fn feature_view<'p>(
    map: &Map,
    kf_id: KeyFrameId,
    pose: &'p SE3,
    feature_idx: usize,
    scale: LevelScale,
) -> Option<(View<'p>, Option<MapPointId>)> {
    let kf = map.get_keyframe(kf_id)?;
    let kp = kf.keypoints.get(feature_idx)?;
    Some((
        View {
            pose,
            pixel: kp.pt(),
            sigma2: scale.sigma2(kp.level),
        },
        kf.get_map_point(feature_idx),
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Depth back-projection
// ─────────────────────────────────────────────────────────────────────────────

/// Create a landmark from a keyframe feature's sensor depth.
///
/// Zero, NaN and out-of-range readings are rejected with
/// `TriangulationFailed`; they never become landmarks.
pub fn back_project_depth(
    map: &mut Map,
    camera: &CalibratedCamera,
    kf_id: KeyFrameId,
    feature_idx: usize,
    depth_config: &DepthConfig,
) -> Result<MapPointId> {
    let kf = map
        .get_keyframe(kf_id)
        .ok_or_else(|| SlamError::TriangulationFailed(format!("{} not in map", kf_id)))?;
    let depth = kf.depths.get(feature_idx).copied().flatten();
    let Some(z) = depth.filter(|z| *z != 0.0 && depth_config.is_trusted(*z)) else {
        return Err(SlamError::TriangulationFailed(format!(
            "feature {} of {} has no trusted depth ({:?})",
            feature_idx, kf_id, depth
        )));
    };
    let pixel = kf.pixel(feature_idx);
    let p_world = kf.pose.transform_point(&camera.unproject(pixel.x, pixel.y, z));
    map.create_map_point(p_world, kf_id, feature_idx, LandmarkOrigin::DepthBackProjected)
}

/// Back-project every unassociated feature of a keyframe that has trusted
/// depth. Returns the created landmarks.
pub fn back_project_keyframe(
    map: &mut Map,
    camera: &CalibratedCamera,
    kf_id: KeyFrameId,
    depth_config: &DepthConfig,
) -> Vec<MapPointId> {
    let candidates: Vec<usize> = match map.get_keyframe(kf_id) {
        Some(kf) => (0..kf.num_features())
            .filter(|&i| kf.get_map_point(i).is_none() && kf.depths[i].is_some())
            .collect(),
        None => return Vec::new(),
    };
    candidates
        .into_iter()
        .filter_map(|i| back_project_depth(map, camera, kf_id, i, depth_config).ok())
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Neighbour triangulation
// ─────────────────────────────────────────────────────────────────────────────

/// Match the unassociated features of two keyframes with known poses.
///
/// Returns `(feature in A, feature in B)` pairs that pass the descriptor
/// threshold and lie near each other's epipolar line.
pub fn search_for_triangulation(
    kf_a: &KeyFrame,
    kf_b: &KeyFrame,
    matcher: &DescriptorMatcher,
    camera: &CalibratedCamera,
    scale: LevelScale,
    config: &TriangulationConfig,
) -> Result<Vec<(usize, usize)>> {
    let free_a: Vec<usize> = (0..kf_a.num_features()).filter(|&i| kf_a.get_map_point(i).is_none()).collect();
    let free_b: Vec<usize> = (0..kf_b.num_features()).filter(|&i| kf_b.get_map_point(i).is_none()).collect();
    if free_a.is_empty() || free_b.is_empty() {
        return Ok(Vec::new());
    }

    let matches = matcher.match_descriptors(&kf_a.descriptors.select(&free_a), &kf_b.descriptors.select(&free_b))?;
    let max_dist = scaled_threshold(config.max_descriptor_distance, kf_a.descriptors.descriptor_len());

    let e = essential_between(&kf_a.pose, &kf_b.pose);
    let focal2 = camera.fx * camera.fy;
    let mut out = Vec::new();
    for m in matches {
        if m.distance > max_dist {
            continue;
        }
        let (ia, ib) = (free_a[m.a], free_b[m.b]);
        let (ka, kb) = (&kf_a.keypoints[ia], &kf_b.keypoints[ib]);
        let xa = camera.normalized(ka.x as f64, ka.y as f64);
        let xb = camera.normalized(kb.x as f64, kb.y as f64);
        let err_px2 = sampson_sq(&e, &xa, &xb) * focal2;
        if err_px2 <= config.max_epipolar_error_sq * scale.sigma2(kb.level) {
            out.push((ia, ib));
        }
    }
    Ok(out)
}

/// Essential matrix with x_bᵀ E x_a = 0 for two camera-to-world poses.
fn essential_between(pose_a: &SE3, pose_b: &SE3) -> Matrix3<f64> {
    let t_ba = pose_b.inverse().compose(pose_a);
    skew(&t_ba.translation) * t_ba.rotation_matrix()
}

/// Statistics of one neighbour-triangulation pass.
#[derive(Debug, Clone, Default)]
pub struct NeighborTriangulation {
    pub pairs_checked: usize,
    pub matches_found: usize,
    pub created: Vec<MapPointId>,
}

/// Triangulate the new keyframe against its best covisible neighbours.
///
/// Pairs with a baseline too short for the scene depth are skipped. A pair
/// that yields no landmark is logged and skipped; it never fails the pass.
pub fn triangulate_from_neighbors(
    map: &mut Map,
    kf_id: KeyFrameId,
    matcher: &DescriptorMatcher,
    camera: &CalibratedCamera,
    scale: LevelScale,
    config: &TriangulationConfig,
) -> Result<NeighborTriangulation> {
    let mut stats = NeighborTriangulation::default();
    let neighbours = map.local_keyframes(kf_id, config.num_neighbors);

    for neighbour in neighbours {
        let (Some(kf), Some(other)) = (map.get_keyframe(kf_id), map.get_keyframe(neighbour)) else {
            continue;
        };
        let baseline = (kf.camera_center() - other.camera_center()).norm();
        let depth = median_depth(map, other).unwrap_or(1.0);
        if baseline / depth < config.min_baseline_ratio {
            continue;
        }
        stats.pairs_checked += 1;

        let pairs = search_for_triangulation(kf, other, matcher, camera, scale, config)?;
        stats.matches_found += pairs.len();
        if pairs.is_empty() {
            continue;
        }
        match triangulate(map, camera, scale, kf_id, neighbour, &pairs, config) {
            Ok(outcome) => stats.created.extend(outcome.created),
            Err(e) if e.is_insufficient_data() => {
                debug!("triangulation {}-{}: {}", kf_id, neighbour, e);
            }
            Err(e) => return Err(e),
        }
    }

    if !stats.created.is_empty() {
        debug!(
            "{}: {} new landmarks (pairs={}, matches={})",
            kf_id,
            stats.created.len(),
            stats.pairs_checked,
            stats.matches_found
        );
    }
    Ok(stats)
}

/// Median depth of a keyframe's landmarks in its own camera frame.
pub fn median_depth(map: &Map, kf: &KeyFrame) -> Option<f64> {
    let pose_cw = kf.pose_cw();
    let mut depths: Vec<f64> = kf
        .get_map_point_indices()
        .filter_map(|(_, id)| map.get_map_point(id))
        .map(|mp| pose_cw.transform_point(&mp.position).z)
        .filter(|z| *z > 0.0)
        .collect();
    if depths.is_empty() {
        return None;
    }
    depths.sort_by(|a, b| a.total_cmp(b));
    Some(depths[depths.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::NewKeyFrame;
    use crate::tracking::frame::{Descriptors, FeatureSet, KeyPoint};
    use crate::tracking::matching::MatcherConfig;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera() -> CalibratedCamera {
        CalibratedCamera::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240)
    }

    fn scene() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                let z = 3.0 + 0.2 * ((i + j) % 3) as f64;
                pts.push(Vector3::new(-0.8 + 0.4 * i as f64, -0.6 + 0.4 * j as f64, z));
            }
        }
        pts
    }

    fn descriptor(i: usize) -> Vec<u8> {
        (0..32).map(|k| ((i * 37 + k * 11) % 251) as u8 ^ (i as u8).rotate_left(k as u32 % 8)).collect()
    }

    /// Keyframe at `pose` seeing every scene point, descriptor i for point i.
    fn keyframe(pose: SE3, depth: bool) -> NewKeyFrame {
        let cam = camera();
        let pose_cw = pose.inverse();
        let mut keypoints = Vec::new();
        let mut rows = Vec::new();
        let mut depths = Vec::new();
        for (i, p) in scene().iter().enumerate() {
            let pc = pose_cw.transform_point(p);
            let uv = cam.project(&pc).unwrap();
            keypoints.push(KeyPoint { x: uv.x as f32, y: uv.y as f32, level: 0, angle: 0.0, response: 1.0 });
            rows.push(descriptor(i));
            depths.push(if depth { Some(pc.z) } else { None });
        }
        NewKeyFrame {
            timestamp_ns: 0,
            pose,
            features: FeatureSet {
                keypoints,
                descriptors: Descriptors::from_rows(32, &rows).unwrap(),
            },
            depths,
            colors: Vec::new(),
            dense: None,
        }
    }

    fn two_keyframes(baseline: f64) -> (Map, KeyFrameId, KeyFrameId) {
        let mut map = Map::new(32);
        let a = map.insert_keyframe(keyframe(SE3::identity(), false)).unwrap();
        let pose_b = SE3::new(UnitQuaternion::identity(), Vector3::new(baseline, 0.0, 0.0));
        let b = map.insert_keyframe(keyframe(pose_b, false)).unwrap();
        (map, a, b)
    }

    fn identity_pairs() -> Vec<(usize, usize)> {
        (0..scene().len()).map(|i| (i, i)).collect()
    }

    #[test]
    fn test_triangulate_recovers_scene() {
        let (mut map, a, b) = two_keyframes(0.3);
        let outcome = triangulate(&mut map, &camera(), LevelScale::new(1.2), a, b, &identity_pairs(), &TriangulationConfig::default()).unwrap();
        assert_eq!(outcome.created.len(), scene().len());
        for (id, truth) in outcome.created.iter().zip(scene()) {
            let mp = map.get_map_point(*id).unwrap();
            assert_relative_eq!(mp.position, truth, epsilon = 1e-3);
            assert_eq!(mp.num_observations(), 2);
        }
        map.check_integrity().unwrap();
    }

    #[test]
    fn test_retriangulation_is_idempotent() {
        let (mut map, a, b) = two_keyframes(0.3);
        let cfg = TriangulationConfig::default();
        let first = triangulate(&mut map, &camera(), LevelScale::new(1.2), a, b, &identity_pairs(), &cfg).unwrap();
        let positions: Vec<Vector3<f64>> = first.created.iter().map(|id| map.get_map_point(*id).unwrap().position).collect();

        let second = triangulate(&mut map, &camera(), LevelScale::new(1.2), a, b, &identity_pairs(), &cfg).unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.existing, first.created);
        assert_eq!(map.num_map_points(), first.created.len());
        for (id, p) in second.existing.iter().zip(positions) {
            assert_relative_eq!(map.get_map_point(*id).unwrap().position, p, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_small_baseline_reports_insufficient_parallax() {
        let (mut map, a, b) = two_keyframes(0.01);
        let err = triangulate(&mut map, &camera(), LevelScale::new(1.2), a, b, &identity_pairs(), &TriangulationConfig::default())
            .unwrap_err();
        assert!(matches!(err, SlamError::InsufficientParallax { degrees } if degrees < 1.0));
        assert_eq!(map.num_map_points(), 0);
    }

    #[test]
    fn test_point_behind_camera_is_rejected() {
        let cam = camera();
        let pose_a = SE3::identity();
        let pose_b = SE3::new(UnitQuaternion::identity(), Vector3::new(0.5, 0.0, 0.0));
        // Rays that only meet behind both cameras.
        let a = View { pose: &pose_a, pixel: Vector2::new(100.0, 120.0), sigma2: 1.0 };
        let b = View { pose: &pose_b, pixel: Vector2::new(200.0, 120.0), sigma2: 1.0 };
        let r = triangulate_point(a, b, &cam, &TriangulationConfig::default());
        assert_eq!(r, Err(Rejection::Depth));
    }

    #[test]
    fn test_back_projection_rejects_invalid_depth() {
        let mut map = Map::new(32);
        let mut new = keyframe(SE3::identity(), true);
        new.depths[0] = Some(0.0);
        new.depths[1] = Some(f64::NAN);
        new.depths[2] = Some(12.0);
        new.depths[3] = None;
        let kf = map.insert_keyframe(new).unwrap();
        let cfg = DepthConfig::default();

        for i in 0..4 {
            assert!(back_project_depth(&mut map, &camera(), kf, i, &cfg).is_err());
        }
        let id = back_project_depth(&mut map, &camera(), kf, 4, &cfg).unwrap();
        let mp = map.get_map_point(id).unwrap();
        assert_relative_eq!(mp.position, scene()[4], epsilon = 1e-4);
        assert_eq!(mp.origin, LandmarkOrigin::DepthBackProjected);

        let created = back_project_keyframe(&mut map, &camera(), kf, &cfg);
        assert_eq!(created.len(), scene().len() - 5);
        assert!(map.map_points().all(|p| p.position.z > 0.0));
    }

    #[test]
    fn test_search_for_triangulation_uses_epipolar_geometry() {
        let (map, a, b) = two_keyframes(0.3);
        let kf_a = map.get_keyframe(a).unwrap();
        let kf_b = map.get_keyframe(b).unwrap();
        let matcher = DescriptorMatcher::new(MatcherConfig::default());
        let pairs = search_for_triangulation(kf_a, kf_b, &matcher, &camera(), LevelScale::new(1.2), &TriangulationConfig::default()).unwrap();
        assert_eq!(pairs.len(), scene().len());
        assert!(pairs.iter().all(|(i, j)| i == j));
    }

    #[test]
    fn test_triangulate_from_neighbors_links_covisible_pair() {
        let (mut map, a, b) = two_keyframes(0.3);
        // Seed covisibility with one depth landmark seen by both.
        let mut c = keyframe(SE3::new(UnitQuaternion::identity(), Vector3::new(0.15, 0.0, 0.0)), true);
        c.depths.iter_mut().skip(1).for_each(|d| *d = None);
        let c = map.insert_keyframe(c).unwrap();
        let mp = back_project_depth(&mut map, &camera(), c, 0, &DepthConfig::default()).unwrap();
        map.associate(a, 0, mp);
        map.associate(b, 0, mp);

        let matcher = DescriptorMatcher::new(MatcherConfig::default());
        let stats =
            triangulate_from_neighbors(&mut map, b, &matcher, &camera(), LevelScale::new(1.2), &TriangulationConfig::default()).unwrap();
        assert!(stats.pairs_checked >= 1);
        assert!(!stats.created.is_empty());
        map.check_integrity().unwrap();
    }
}
