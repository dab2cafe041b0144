//! Landmark refinement with fixed keyframe poses.
//!
//! Each landmark is refined independently by minimizing the
//! sigma-weighted reprojection error over all its observations, using the
//! `levenberg-marquardt` crate. Observations made with a trusted depth
//! reading contribute a third residual on the camera-frame depth, so short
//! baselines cannot slide a landmark along the viewing ray. Poses are held
//! fixed; pose corrections come from the pose graph.
//!
//! The sliding-window pass follows the three-phase pattern used by the
//! local mapper to keep the write lock short:
//! 1. COLLECT (read lock): snapshot observations of the window's landmarks
//! 2. SOLVE (no lock): run LM per landmark
//! 3. APPLY (write lock): write positions back, drop outlier observations

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DVector, Dyn, Matrix2x3, OMatrix, Owned, Vector2, Vector3, U3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::tracking::frame::CalibratedCamera;

use super::triangulation::LevelScale;

/// Floor on the depth noise (millimetre quantisation).
const MIN_DEPTH_SIGMA_M: f64 = 1e-3;

/// Configuration for landmark refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Keyframes in the sliding window (newest keyframe plus covisible ones).
    /// Default: 5
    pub window_keyframes: usize,

    /// LM patience (evaluations per parameter).
    /// Default: 20
    pub patience: usize,

    /// Squared reprojection bound at level 0 for an observation to be kept.
    /// Default: 5.991
    pub max_reproj_error_sq: f64,

    /// Squared bound for observations with a depth reading (reprojection
    /// plus depth term, three degrees of freedom).
    /// Default: 7.815
    pub max_depth_error_sq: f64,

    /// Depth noise model: sigma_z = coeff * z^2 (metres).
    /// Default: 0.0015
    pub depth_noise_coeff: f64,

    /// Refinements moving a landmark farther than this fraction of its
    /// distance to the nearest observer are rejected.
    /// Default: 0.1
    pub max_shift_ratio: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            window_keyframes: 5,
            patience: 20,
            max_reproj_error_sq: 5.991,
            max_depth_error_sq: 7.815,
            depth_noise_coeff: 0.0015,
            max_shift_ratio: 0.1,
        }
    }
}

impl RefinementConfig {
    /// Standard deviation of a depth reading, metres.
    pub fn depth_sigma(&self, depth: f64) -> f64 {
        (self.depth_noise_coeff * depth * depth).max(MIN_DEPTH_SIGMA_M)
    }

    pub fn validate(&self) -> Result<()> {
        if self.patience == 0 {
            return Err(SlamError::Config("mapping.refinement.patience must be positive".into()));
        }
        if self.max_reproj_error_sq <= 0.0 || self.max_depth_error_sq <= 0.0 {
            return Err(SlamError::Config("mapping.refinement error bounds must be positive".into()));
        }
        if self.depth_noise_coeff <= 0.0 {
            return Err(SlamError::Config("mapping.refinement.depth_noise_coeff must be positive".into()));
        }
        if self.max_shift_ratio <= 0.0 {
            return Err(SlamError::Config("mapping.refinement.max_shift_ratio must be positive".into()));
        }
        Ok(())
    }
}

/// One observation used by the refinement.
#[derive(Debug, Clone)]
pub struct ObservationRef {
    pub kf_id: KeyFrameId,
    /// World-to-camera pose of the observing keyframe.
    pub pose_cw: SE3,
    pub pixel: Vector2<f64>,
    pub sigma2: f64,
    /// Trusted depth reading at the feature, metres.
    pub depth: Option<f64>,
}

/// Snapshot of a landmark and its observations.
#[derive(Debug, Clone)]
pub struct LandmarkObservations {
    pub id: MapPointId,
    pub position: Vector3<f64>,
    pub observations: Vec<ObservationRef>,
}

/// Refinement result for one landmark.
#[derive(Debug, Clone)]
pub struct RefinedLandmark {
    pub id: MapPointId,
    pub position: Vector3<f64>,
    /// Observers whose error exceeds the bound at the new position.
    pub outliers: Vec<KeyFrameId>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Least-squares problem
// ─────────────────────────────────────────────────────────────────────────────

/// Three rows per observation: u, v and depth. The depth row stays zero
/// for observations without a reading.
struct LandmarkProblem<'a> {
    camera: &'a CalibratedCamera,
    config: &'a RefinementConfig,
    observations: &'a [ObservationRef],
    position: Vector3<f64>,
}

impl<'a> LeastSquaresProblem<f64, Dyn, U3> for LandmarkProblem<'a> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, x: &Vector3<f64>) {
        self.position = *x;
    }

    fn params(&self) -> Vector3<f64> {
        self.position
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(3 * self.observations.len());
        for (i, obs) in self.observations.iter().enumerate() {
            let pc = obs.pose_cw.transform_point(&self.position);
            let uv = self.camera.project(&pc)?;
            let inv_sigma = 1.0 / obs.sigma2.sqrt();
            r[3 * i] = (uv.x - obs.pixel.x) * inv_sigma;
            r[3 * i + 1] = (uv.y - obs.pixel.y) * inv_sigma;
            if let Some(d) = obs.depth {
                r[3 * i + 2] = (pc.z - d) / self.config.depth_sigma(d);
            }
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U3>> {
        let mut j = OMatrix::<f64, Dyn, U3>::zeros(3 * self.observations.len());
        for (i, obs) in self.observations.iter().enumerate() {
            let pc = obs.pose_cw.transform_point(&self.position);
            if pc.z <= 1e-9 {
                return None;
            }
            let inv_z = 1.0 / pc.z;
            let j_proj = Matrix2x3::new(
                self.camera.fx * inv_z, 0.0, -self.camera.fx * pc.x * inv_z * inv_z,
                0.0, self.camera.fy * inv_z, -self.camera.fy * pc.y * inv_z * inv_z,
            );
            let rot = obs.pose_cw.rotation_matrix();
            let block = j_proj * rot / obs.sigma2.sqrt();
            j.fixed_view_mut::<2, 3>(3 * i, 0).copy_from(&block);
            if let Some(d) = obs.depth {
                let row = rot.row(2) / self.config.depth_sigma(d);
                j.fixed_view_mut::<1, 3>(3 * i + 2, 0).copy_from(&row);
            }
        }
        Some(j)
    }
}

/// Refine one landmark against its observations.
///
/// The worst observation is dropped and the landmark re-solved while it
/// exceeds the error bound and more than two observations remain. Returns
/// `None` when there are fewer than two observations, the solver fails, the
/// refined point ends up behind an observer, or it moved farther than
/// `max_shift_ratio` of its distance to the nearest observer.
pub fn refine_landmark(
    landmark: &LandmarkObservations,
    camera: &CalibratedCamera,
    config: &RefinementConfig,
) -> Option<RefinedLandmark> {
    if landmark.observations.len() < 2 {
        return None;
    }
    let mut active: Vec<ObservationRef> = landmark.observations.clone();
    let mut position = landmark.position;
    let mut outliers = Vec::new();

    loop {
        position = solve_position(position, &active, camera, config)?;
        let mut worst: Option<(usize, f64)> = None;
        for (i, obs) in active.iter().enumerate() {
            let pc = obs.pose_cw.transform_point(&position);
            if pc.z <= 0.0 {
                return None;
            }
            let (err2, bound) = observation_error(obs, &pc, camera, config);
            // Normalised so mono and depth observations rank together.
            let excess = err2 / bound;
            if excess > 1.0 && worst.map_or(true, |(_, w)| excess > w) {
                worst = Some((i, excess));
            }
        }
        match worst {
            None => break,
            Some((i, _)) if active.len() > 2 => {
                outliers.push(active.remove(i).kf_id);
            }
            Some(_) => {
                // Two views left and they disagree: both are suspect.
                outliers.extend(active.iter().map(|o| o.kf_id));
                break;
            }
        }
    }

    let shift = (position - landmark.position).norm();
    let nearest = landmark
        .observations
        .iter()
        .map(|o| (o.pose_cw.inverse().translation - landmark.position).norm())
        .fold(f64::INFINITY, f64::min);
    if shift > config.max_shift_ratio * nearest {
        debug!(
            "[LocalMapping] {}: refinement rejected, shift {:.3} m at range {:.3} m",
            landmark.id, shift, nearest
        );
        return None;
    }
    Some(RefinedLandmark {
        id: landmark.id,
        position,
        outliers,
    })
}

/// Squared whitened error of one observation and its chi-square bound.
fn observation_error(
    obs: &ObservationRef,
    pc: &Vector3<f64>,
    camera: &CalibratedCamera,
    config: &RefinementConfig,
) -> (f64, f64) {
    let reproj = camera
        .project(pc)
        .map_or(f64::INFINITY, |uv| (uv - obs.pixel).norm_squared())
        / obs.sigma2;
    match obs.depth {
        Some(d) => {
            let dz = (pc.z - d) / config.depth_sigma(d);
            (reproj + dz * dz, config.max_depth_error_sq)
        }
        None => (reproj, config.max_reproj_error_sq),
    }
}

fn solve_position(
    start: Vector3<f64>,
    observations: &[ObservationRef],
    camera: &CalibratedCamera,
    config: &RefinementConfig,
) -> Option<Vector3<f64>> {
    let problem = LandmarkProblem {
        camera,
        config,
        observations,
        position: start,
    };
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(config.patience)
        .minimize(problem);
    if !report.termination.was_successful() {
        return None;
    }
    let position = problem.position;
    position.iter().all(|v| v.is_finite()).then_some(position)
}

/// Snapshot a landmark's observations.
pub fn collect_landmark(map: &Map, mp_id: MapPointId, scale: LevelScale) -> Option<LandmarkObservations> {
    let mp = map.get_map_point(mp_id)?;
    let observations = mp
        .observations
        .iter()
        .filter_map(|(kf_id, obs)| {
            let kf = map.get_keyframe(*kf_id)?;
            let level = kf.keypoints.get(obs.feature_idx)?.level;
            Some(ObservationRef {
                kf_id: *kf_id,
                pose_cw: kf.pose_cw(),
                pixel: obs.pixel,
                sigma2: scale.sigma2(level),
                depth: kf.depths.get(obs.feature_idx).copied().flatten(),
            })
        })
        .collect();
    Some(LandmarkObservations {
        id: mp_id,
        position: mp.position,
        observations,
    })
}

/// Write refined positions back and drop outlier observations.
///
/// A landmark must keep at least one observation; if every observation is
/// an outlier the landmark is left untouched. Returns the number of
/// landmarks moved.
pub fn apply_refinements(map: &mut Map, refined: &[RefinedLandmark]) -> usize {
    let mut moved = 0;
    for r in refined {
        let Some(mp) = map.get_map_point(r.id) else {
            continue;
        };
        if r.outliers.len() >= mp.num_observations() {
            continue;
        }
        let to_drop: Vec<(KeyFrameId, usize)> = r
            .outliers
            .iter()
            .filter_map(|kf| mp.observations.get(kf).map(|o| (*kf, o.feature_idx)))
            .collect();
        if let Some(mp) = map.get_map_point_mut(r.id) {
            mp.position = r.position;
        }
        for (kf, feat) in to_drop {
            map.disassociate(kf, feat);
        }
        map.update_map_point_normal(r.id);
        moved += 1;
    }
    moved
}

// ─────────────────────────────────────────────────────────────────────────────
// Map-level operations
// ─────────────────────────────────────────────────────────────────────────────

/// Landmarks of a keyframe's sliding window, with their observations.
pub fn collect_window(
    map: &Map,
    kf_id: KeyFrameId,
    scale: LevelScale,
    config: &RefinementConfig,
) -> Vec<LandmarkObservations> {
    let mut window = map.local_keyframes(kf_id, config.window_keyframes.saturating_sub(1));
    window.push(kf_id);
    map.map_points_from_keyframes(&window)
        .into_iter()
        .filter_map(|id| collect_landmark(map, id, scale))
        .filter(|lm| lm.observations.len() >= 2)
        .collect()
}

/// Refine every collected landmark. Runs without touching the map.
pub fn solve_window(
    landmarks: &[LandmarkObservations],
    camera: &CalibratedCamera,
    config: &RefinementConfig,
) -> Vec<RefinedLandmark> {
    landmarks
        .iter()
        .filter_map(|lm| refine_landmark(lm, camera, config))
        .collect()
}

/// Add an observation of `mp_id` at a keyframe feature and re-optimize the
/// landmark from all its observations.
///
/// If the feature already holds another landmark, the one with fewer
/// observations is merged into the other. Returns the surviving landmark.
pub fn fuse_observation(
    map: &mut Map,
    camera: &CalibratedCamera,
    scale: LevelScale,
    mp_id: MapPointId,
    kf_id: KeyFrameId,
    feature_idx: usize,
    config: &RefinementConfig,
) -> Result<MapPointId> {
    let kf = map
        .get_keyframe(kf_id)
        .ok_or_else(|| SlamError::TriangulationFailed(format!("{} not in map", kf_id)))?;
    if feature_idx >= kf.num_features() {
        return Err(SlamError::TriangulationFailed(format!(
            "feature {} out of range for {}",
            feature_idx, kf_id
        )));
    }
    let current = kf.get_map_point(feature_idx);
    let mp = map
        .get_map_point(mp_id)
        .ok_or_else(|| SlamError::TriangulationFailed(format!("{} not in map", mp_id)))?;

    let kept = match current {
        Some(existing) if existing == mp_id => mp_id,
        Some(existing) => {
            let other_obs = map.get_map_point(existing).map_or(0, |p| p.num_observations());
            let (keep, remove) = if other_obs > mp.num_observations() {
                (existing, mp_id)
            } else {
                (mp_id, existing)
            };
            map.replace_map_point(remove, keep);
            keep
        }
        None => {
            if let Some(obs) = mp.observations.get(&kf_id) {
                // Already seen from this keyframe at another feature.
                let other = obs.feature_idx;
                return Err(SlamError::TriangulationFailed(format!(
                    "{} already observes {} at feature {}",
                    kf_id, mp_id, other
                )));
            }
            map.associate(kf_id, feature_idx, mp_id);
            mp_id
        }
    };

    if let Some(snapshot) = collect_landmark(map, kept, scale) {
        if let Some(refined) = refine_landmark(&snapshot, camera, config) {
            apply_refinements(map, std::slice::from_ref(&refined));
        }
    }
    map.update_map_point_descriptor(kept);
    debug!("fused {} into {} feature {}", kept, kf_id, feature_idx);
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::{LandmarkOrigin, NewKeyFrame};
    use crate::tracking::frame::{Descriptors, FeatureSet, KeyPoint};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera() -> CalibratedCamera {
        CalibratedCamera::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240)
    }

    fn truth() -> Vector3<f64> {
        Vector3::new(0.2, -0.1, 3.0)
    }

    fn pose(x: f64) -> SE3 {
        SE3::new(UnitQuaternion::from_euler_angles(0.0, -0.05 * x, 0.0), Vector3::new(x, 0.0, 0.0))
    }

    /// Keyframe seeing the true point at feature 0, plus a decoy feature.
    fn keyframe(x: f64) -> NewKeyFrame {
        let uv = camera().project(&pose(x).inverse().transform_point(&truth())).unwrap();
        let kps = vec![
            KeyPoint { x: uv.x as f32, y: uv.y as f32, level: 0, angle: 0.0, response: 1.0 },
            KeyPoint { x: 10.0, y: 10.0, level: 0, angle: 0.0, response: 1.0 },
        ];
        NewKeyFrame {
            timestamp_ns: 0,
            pose: pose(x),
            features: FeatureSet {
                keypoints: kps,
                descriptors: Descriptors::from_rows(32, &[[7u8; 32], [200u8; 32]]).unwrap(),
            },
            depths: Vec::new(),
            colors: Vec::new(),
            dense: None,
        }
    }

    #[test]
    fn test_refine_landmark_converges_from_perturbed_start() {
        let cam = camera();
        let observations: Vec<ObservationRef> = [0.0, 0.2, 0.4]
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let pose_cw = pose(x).inverse();
                let pixel = cam.project(&pose_cw.transform_point(&truth())).unwrap();
                ObservationRef { kf_id: KeyFrameId(i as u64), pose_cw, pixel, sigma2: 1.0, depth: None }
            })
            .collect();
        let lm = LandmarkObservations {
            id: MapPointId(0),
            position: truth() + Vector3::new(0.05, -0.03, 0.2),
            observations,
        };
        let refined = refine_landmark(&lm, &cam, &RefinementConfig::default()).unwrap();
        assert_relative_eq!(refined.position, truth(), epsilon = 1e-6);
        assert!(refined.outliers.is_empty());
    }

    /// Two views 2 cm apart with half-pixel noise that halves the disparity.
    fn short_baseline(with_depth: bool) -> LandmarkObservations {
        let cam = camera();
        let observations = [(0.0, -0.5), (0.02, 0.5)]
            .iter()
            .enumerate()
            .map(|(i, &(x, noise))| {
                let pose_cw = pose(x).inverse();
                let pc = pose_cw.transform_point(&truth());
                let pixel = cam.project(&pc).unwrap() + Vector2::new(noise, 0.0);
                ObservationRef {
                    kf_id: KeyFrameId(i as u64),
                    pose_cw,
                    pixel,
                    sigma2: 1.0,
                    depth: with_depth.then_some(pc.z),
                }
            })
            .collect();
        LandmarkObservations { id: MapPointId(0), position: truth(), observations }
    }

    #[test]
    fn test_depth_readings_hold_landmark_on_short_baseline() {
        let lm = short_baseline(true);
        let refined = refine_landmark(&lm, &camera(), &RefinementConfig::default()).unwrap();
        assert!((refined.position - truth()).norm() < 0.01, "{:?}", refined.position);
        assert!(refined.outliers.is_empty());
    }

    #[test]
    fn test_refinement_sliding_along_the_ray_is_rejected() {
        // Without depth the noisy disparity pulls the point to about twice
        // its range, far past the shift bound.
        let lm = short_baseline(false);
        assert!(refine_landmark(&lm, &camera(), &RefinementConfig::default()).is_none());
    }

    #[test]
    fn test_depth_sigma_grows_with_range() {
        let cfg = RefinementConfig::default();
        assert_relative_eq!(cfg.depth_sigma(0.3), 1e-3);
        assert_relative_eq!(cfg.depth_sigma(2.0), 0.006, epsilon = 1e-12);
        assert!(cfg.depth_sigma(4.0) > cfg.depth_sigma(2.0));
    }

    #[test]
    fn test_single_observation_is_not_refined() {
        let lm = LandmarkObservations {
            id: MapPointId(0),
            position: truth(),
            observations: vec![ObservationRef {
                kf_id: KeyFrameId(0),
                pose_cw: SE3::identity(),
                pixel: Vector2::new(180.0, 110.0),
                sigma2: 1.0,
                depth: None,
            }],
        };
        assert!(refine_landmark(&lm, &camera(), &RefinementConfig::default()).is_none());
    }

    #[test]
    fn test_fuse_observation_moves_landmark_toward_consensus() {
        let mut map = Map::new(32);
        let a = map.insert_keyframe(keyframe(0.0)).unwrap();
        let b = map.insert_keyframe(keyframe(0.3)).unwrap();
        let c = map.insert_keyframe(keyframe(0.6)).unwrap();

        let start = truth() + Vector3::new(0.0, 0.0, 0.15);
        let mp = map.create_map_point(start, a, 0, LandmarkOrigin::DepthBackProjected).unwrap();
        let scale = LevelScale::new(1.2);
        let cfg = RefinementConfig::default();

        let kept = fuse_observation(&mut map, &camera(), scale, mp, b, 0, &cfg).unwrap();
        assert_eq!(kept, mp);
        fuse_observation(&mut map, &camera(), scale, mp, c, 0, &cfg).unwrap();

        let p = map.get_map_point(mp).unwrap();
        assert_eq!(p.num_observations(), 3);
        assert!((p.position - truth()).norm() < 1e-3);

        // Fusing the same observation again changes nothing.
        let again = fuse_observation(&mut map, &camera(), scale, mp, c, 0, &cfg).unwrap();
        assert_eq!(again, mp);
        assert_eq!(map.get_map_point(mp).unwrap().num_observations(), 3);
        map.check_integrity().unwrap();
    }

    #[test]
    fn test_fuse_merges_duplicate_landmarks() {
        let mut map = Map::new(32);
        let a = map.insert_keyframe(keyframe(0.0)).unwrap();
        let b = map.insert_keyframe(keyframe(0.3)).unwrap();
        let c = map.insert_keyframe(keyframe(0.6)).unwrap();
        let scale = LevelScale::new(1.2);
        let cfg = RefinementConfig::default();

        let big = map.create_map_point(truth(), a, 0, LandmarkOrigin::Triangulated).unwrap();
        map.associate(b, 0, big);
        let small = map.create_map_point(truth(), c, 0, LandmarkOrigin::DepthBackProjected).unwrap();

        let kept = fuse_observation(&mut map, &camera(), scale, small, b, 0, &cfg).unwrap();
        assert_eq!(kept, big);
        assert!(map.get_map_point(small).is_none());
        assert_eq!(map.get_map_point(big).unwrap().num_observations(), 3);
        map.check_integrity().unwrap();
    }

    #[test]
    fn test_window_refinement_drops_outlier_observation() {
        let mut map = Map::new(32);
        let a = map.insert_keyframe(keyframe(0.0)).unwrap();
        let b = map.insert_keyframe(keyframe(0.3)).unwrap();
        let c = map.insert_keyframe(keyframe(0.6)).unwrap();
        let mp = map.create_map_point(truth(), a, 0, LandmarkOrigin::Triangulated).unwrap();
        map.associate(b, 0, mp);
        map.associate(c, 0, mp);
        // Corrupt one observation far from the others.
        map.get_map_point_mut(mp).unwrap().observations.get_mut(&c).unwrap().pixel += Vector2::new(40.0, 0.0);

        let cfg = RefinementConfig::default();
        let snapshot = collect_window(&map, c, LevelScale::new(1.2), &cfg);
        assert_eq!(snapshot.len(), 1);
        let refined = solve_window(&snapshot, &camera(), &cfg);
        assert_eq!(refined[0].outliers, vec![c]);
        assert_eq!(apply_refinements(&mut map, &refined), 1);
        let p = map.get_map_point(mp).unwrap();
        assert_eq!(p.num_observations(), 2);
        assert!(!p.is_observed_by(c));
        assert!((p.position - truth()).norm() < 1e-3);
        map.check_integrity().unwrap();
    }
}
