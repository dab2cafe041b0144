//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! - Reads the shared `Atlas` through the RwLock, writing only to bootstrap
//! - Tracks landmarks of the reference keyframe's neighbourhood by
//!   projection into the current frame, verified with RANSAC PnP
//! - Uses a gyro rotation prior when inertial coverage is complete, a
//!   constant-velocity model otherwise
//! - Relocalizes against the whole map every frame while lost
//! - Sends new keyframes to Local Mapping via channel

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, MapPointId, NewKeyFrame};
use crate::atlas::Atlas;
use crate::config::{ProcessingMode, SlamConfig};
use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::imu::GyroPreintegrator;
use crate::local_mapping::triangulation::{back_project_keyframe, triangulate, LevelScale};
use crate::relocalization::locate;
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::{SessionStats, SharedState};
use crate::tracking::frame::{CalibratedCamera, Frame, OrbExtractor};
use crate::tracking::keyframe_decision::{FrameQuality, KeyFrameConfig, KeyFrameDecision, KeyFrameVerdict};
use crate::tracking::matching::{DescriptorMatcher, Match, PoseVerification};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::result::{TimingStats, TrackingMetrics, TrackingResult};
use crate::tracking::tracking_frame::{DepthSource, TrackingFrame};
use crate::tracking::TrackingState;

/// Tracking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub keyframe: KeyFrameConfig,

    /// Verified PnP inliers below which the frame is lost.
    /// Default: 10
    pub min_inliers: usize,

    /// Projection search radius around the predicted position, pixels.
    /// Default: 15.0
    pub search_radius_px: f64,

    /// Radius of the retry when the first search finds too few matches.
    /// Default: 40.0
    pub wide_search_radius_px: f64,

    /// Radius of the second search around projections from the verified
    /// pose, before the final pose refinement.
    /// Default: 5.0
    pub refine_search_radius_px: f64,

    /// Covisible keyframes whose landmarks form the local map.
    /// Default: 10
    pub local_keyframes: usize,

    /// Landmarks the bootstrap must create before tracking starts.
    /// Default: 50
    pub bootstrap_min_landmarks: usize,

    /// Minimum median parallax of a monocular bootstrap pair, degrees.
    /// Default: 1.0
    pub bootstrap_min_parallax_deg: f64,

    /// Frames after which a monocular bootstrap reference is replaced.
    /// Default: 30
    pub bootstrap_max_frames: usize,

    /// Window around each reference keypoint searched for its match in the
    /// second bootstrap frame, pixels.
    /// Default: 100.0
    pub bootstrap_search_radius_px: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            keyframe: KeyFrameConfig::default(),
            min_inliers: 10,
            search_radius_px: 15.0,
            wide_search_radius_px: 40.0,
            refine_search_radius_px: 5.0,
            local_keyframes: 10,
            bootstrap_min_landmarks: 50,
            bootstrap_min_parallax_deg: 1.0,
            bootstrap_max_frames: 30,
            bootstrap_search_radius_px: 100.0,
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<()> {
        self.keyframe.validate()?;
        if self.min_inliers < 4 {
            return Err(SlamError::Config("tracking.min_inliers must be at least 4".into()));
        }
        if !(self.refine_search_radius_px > 0.0
            && self.search_radius_px >= self.refine_search_radius_px
            && self.wide_search_radius_px >= self.search_radius_px)
        {
            return Err(SlamError::Config(
                "tracking search radii must satisfy 0 < refine <= search <= wide".into(),
            ));
        }
        if self.bootstrap_min_parallax_deg <= 0.0
            || self.bootstrap_max_frames == 0
            || self.bootstrap_search_radius_px <= 0.0
        {
            return Err(SlamError::Config("tracking bootstrap limits must be positive".into()));
        }
        Ok(())
    }
}

/// Pose and associations from tracking the local map.
struct LocalMapTrack {
    pose: SE3,
    matched: Vec<Option<MapPointId>>,
    visible: Vec<MapPointId>,
    num_matches: usize,
    num_inliers: usize,
}

/// First frame of a monocular bootstrap pair.
struct BootstrapReference {
    frame: TrackingFrame,
    age: usize,
}

/// Main tracking structure.
pub struct Tracker {
    camera: CalibratedCamera,
    config: Arc<SlamConfig>,
    extractor: OrbExtractor,
    matcher: DescriptorMatcher,
    preintegrator: GyroPreintegrator,
    depth_source: DepthSource,

    /// Current pose (T_wc).
    pub pose: SE3,

    /// Tracking state machine.
    pub state: TrackingState,

    motion_model: MotionModel,
    kf_decision: KeyFrameDecision,

    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyFrameId>,

    /// Pose of the last frame promoted to keyframe.
    last_kf_pose: SE3,

    /// Reference keyframe and its pose when last seen, to re-anchor after
    /// a pose-graph correction.
    anchor: Option<(KeyFrameId, SE3)>,
    generation: u64,

    last_timestamp_ns: Option<u64>,
    bootstrap: Option<BootstrapReference>,

    /// Shared state (Atlas, flags) - thread-safe access.
    shared: Arc<SharedState>,

    /// Channel to send keyframes to Local Mapping.
    kf_sender: Sender<NewKeyFrameMsg>,
    keyframes_sent: u64,

    /// Transitions into LOST.
    lost_transitions: usize,
}

impl Tracker {
    pub fn new(
        camera: CalibratedCamera,
        config: Arc<SlamConfig>,
        shared: Arc<SharedState>,
        kf_sender: Sender<NewKeyFrameMsg>,
    ) -> Result<Self> {
        let extractor = OrbExtractor::new(config.extractor.clone())?;
        let matcher = DescriptorMatcher::new(config.matcher.clone());
        let preintegrator = GyroPreintegrator::new(&config.imu);
        let depth_source = config.system.depth_source;
        let kf_decision = KeyFrameDecision::new(config.tracking.keyframe.clone());
        Ok(Self {
            camera,
            extractor,
            matcher,
            preintegrator,
            depth_source,
            pose: SE3::identity(),
            state: TrackingState::Uninitialized,
            motion_model: MotionModel::new(),
            kf_decision,
            reference_kf: None,
            last_kf_pose: SE3::identity(),
            anchor: None,
            generation: 0,
            last_timestamp_ns: None,
            bootstrap: None,
            shared,
            kf_sender,
            keyframes_sent: 0,
            lost_transitions: 0,
            config,
        })
    }

    /// Number of times tracking went from TRACKING to LOST.
    pub fn lost_transitions(&self) -> usize {
        self.lost_transitions
    }

    /// Process one frame and return a `TrackingResult`.
    ///
    /// Corrupted or mis-calibrated frames fail with `InvalidFrame` /
    /// `Calibration` and leave the tracker untouched. Losing track is not
    /// an error: it is reported through the result's state.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<TrackingResult> {
        let t_start = Instant::now();
        let tf = TrackingFrame::new(frame, &self.camera, &self.extractor, &self.config.depth, self.depth_source)?;
        let extract_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        let prev_pose = self.pose.clone();

        let mut metrics = TrackingMetrics {
            n_features: tf.num_features(),
            n_depth_features: tf.num_depth_features(),
            ..TrackingMetrics::default()
        };
        let mut timing = TimingStats {
            extract_orb_ms: extract_ms,
            ..TimingStats::default()
        };
        let mut keyframe = None;

        let t_track = Instant::now();
        match self.state {
            TrackingState::Uninitialized => {
                if self.bootstrap_map(&tf)? {
                    self.state = TrackingState::Tracking;
                    metrics.n_inliers = self.reference_landmarks();
                }
            }
            TrackingState::Tracking => {
                let (predicted, used_imu) = self.predict(frame, &tf);
                metrics.used_imu_prior = used_imu;
                match self.track(&tf, &predicted) {
                    Ok(track) => {
                        metrics.n_map_point_matches = track.num_matches;
                        metrics.n_inliers = track.num_inliers;
                        self.pose = track.pose.clone();
                        keyframe = Some(self.maybe_create_keyframe(&tf, &track));
                    }
                    Err(e) if e.is_insufficient_data() => {
                        self.lost_transitions += 1;
                        self.state = TrackingState::Lost;
                        warn!("[Tracking] lost at {} ns: {}", tf.timestamp_ns, e);
                    }
                    Err(e) => return Err(e),
                }
            }
            TrackingState::Lost | TrackingState::Relocalizing => {
                let t_reloc = Instant::now();
                match self.relocalize(&tf) {
                    Ok(n) => {
                        metrics.n_inliers = n;
                        self.state = TrackingState::Tracking;
                    }
                    Err(e) if e.is_insufficient_data() => self.state = TrackingState::Relocalizing,
                    Err(e) => return Err(e),
                }
                timing.relocal_ms = t_reloc.elapsed().as_secs_f64() * 1000.0;
            }
        }
        timing.track_ms = t_track.elapsed().as_secs_f64() * 1000.0;

        if self.state.has_pose() {
            self.motion_model.update(&self.pose);
        }
        self.last_timestamp_ns = Some(tf.timestamp_ns);

        metrics.inlier_ratio = if metrics.n_map_point_matches > 0 {
            metrics.n_inliers as f64 / metrics.n_map_point_matches as f64
        } else {
            0.0
        };
        metrics.delta_translation_m = self.pose.distance_to(&prev_pose);
        metrics.delta_rotation_deg = self.pose.angle_to(&prev_pose).to_degrees();
        timing.total_ms = t_start.elapsed().as_secs_f64() * 1000.0;

        debug!(
            "[Tracking] {} ns: {:?}, {} features, {}/{} inliers",
            tf.timestamp_ns, self.state, metrics.n_features, metrics.n_inliers, metrics.n_map_point_matches
        );

        Ok(TrackingResult {
            timestamp_ns: tf.timestamp_ns,
            state: self.state,
            pose: self.pose.clone(),
            reference_kf_id: self.reference_kf,
            metrics,
            timing,
            keyframe,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bootstrap
    // ─────────────────────────────────────────────────────────────────────────

    /// Build the initial map. Returns whether tracking can start.
    fn bootstrap_map(&mut self, tf: &TrackingFrame) -> Result<bool> {
        if tf.num_depth_features() >= self.config.tracking.bootstrap_min_landmarks {
            return self.bootstrap_depth(tf);
        }
        self.bootstrap_monocular(tf)
    }

    /// RGB-D: one keyframe, landmarks straight from depth.
    fn bootstrap_depth(&mut self, tf: &TrackingFrame) -> Result<bool> {
        let shared = self.shared.clone();
        let mut atlas = shared.atlas.write();
        let kf_id = atlas.insert_keyframe(new_keyframe(tf, SE3::identity()))?;
        let created = back_project_keyframe(atlas.map_mut(), &self.camera, kf_id, &self.config.depth);
        if created.len() < self.config.tracking.bootstrap_min_landmarks {
            atlas.remove_keyframe(kf_id);
            debug!("[Tracking] depth bootstrap: only {} landmarks", created.len());
            return Ok(false);
        }
        for id in &created {
            atlas.map_mut().update_map_point_normal(*id);
        }
        info!("[Tracking] map initialized from depth: {} with {} landmarks", kf_id, created.len());
        self.bootstrap = None;
        self.start_tracking(&atlas, kf_id, SE3::identity(), created.len());
        Ok(true)
    }

    /// Monocular: two-view reconstruction with the scene's median depth
    /// normalized to 1.
    fn bootstrap_monocular(&mut self, tf: &TrackingFrame) -> Result<bool> {
        let Some(mut reference) = self.bootstrap.take() else {
            self.bootstrap = Some(BootstrapReference {
                frame: tf.clone(),
                age: 0,
            });
            return Ok(false);
        };
        reference.age += 1;

        match self.two_view_bootstrap(&reference.frame, tf) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.keep_or_replace_reference(reference, tf);
                Ok(false)
            }
            Err(e) if e.is_insufficient_data() => {
                debug!("[Tracking] monocular bootstrap: {}", e);
                self.keep_or_replace_reference(reference, tf);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn keep_or_replace_reference(&mut self, reference: BootstrapReference, tf: &TrackingFrame) {
        self.bootstrap = if reference.age >= self.config.tracking.bootstrap_max_frames {
            Some(BootstrapReference {
                frame: tf.clone(),
                age: 0,
            })
        } else {
            Some(reference)
        };
    }

    fn two_view_bootstrap(&mut self, first: &TrackingFrame, second: &TrackingFrame) -> Result<bool> {
        // Keypoints barely move between the bootstrap frames: search each
        // reference keypoint's window instead of the whole image.
        let reference: Vec<(Vector2<f64>, &[u8])> = first
            .features
            .keypoints
            .iter()
            .zip(first.features.descriptors.iter())
            .map(|(kp, desc)| (kp.pt(), desc))
            .collect();
        let matches = self.matcher.search_by_projection(
            &reference,
            &second.features.keypoints,
            &second.features.descriptors,
            self.config.tracking.bootstrap_search_radius_px,
        );
        let verified = self.matcher.verify_epipolar(
            &first.features.keypoints,
            &second.features.keypoints,
            &matches,
            &self.camera,
        )?;
        let parallax = verified.geometry.median_parallax_deg;
        if parallax < self.config.tracking.bootstrap_min_parallax_deg {
            return Err(SlamError::InsufficientParallax { degrees: parallax });
        }

        let mut depths: Vec<f64> = verified.geometry.points.iter().flatten().map(|p| p.z).collect();
        if depths.is_empty() {
            return Err(SlamError::TriangulationFailed("no point in front of both views".into()));
        }
        depths.sort_by(|a, b| a.total_cmp(b));
        let median = depths[depths.len() / 2];

        // Camera 2 in the frame of camera 1, at unit median depth.
        let pose_21 = &verified.geometry.pose_21;
        let pose_2 = SE3::new(pose_21.rotation, pose_21.translation / median).inverse();
        let pairs: Vec<(usize, usize)> = verified.inliers.iter().map(|m| (m.a, m.b)).collect();

        let shared = self.shared.clone();
        let mut atlas = shared.atlas.write();
        let kf_1 = atlas.insert_keyframe(new_keyframe(first, SE3::identity()))?;
        let kf_2 = atlas.insert_keyframe(new_keyframe(second, pose_2.clone()))?;
        let outcome = triangulate(
            atlas.map_mut(),
            &self.camera,
            LevelScale::new(self.config.extractor.scale_factor),
            kf_1,
            kf_2,
            &pairs,
            &self.config.mapping.triangulation,
        );
        let created = match outcome {
            Ok(o) if o.created.len() >= self.config.tracking.bootstrap_min_landmarks => o.created.len(),
            other => {
                atlas.remove_keyframe(kf_2);
                atlas.remove_keyframe(kf_1);
                return match other {
                    Ok(o) => {
                        debug!("[Tracking] monocular bootstrap: only {} landmarks", o.created.len());
                        Ok(false)
                    }
                    Err(e) => Err(e),
                };
            }
        };
        info!(
            "[Tracking] map initialized from two views ({:?}): {} and {}, {} landmarks, parallax {:.2} deg",
            verified.geometry.model, kf_1, kf_2, created, parallax
        );
        self.bootstrap = None;
        self.start_tracking(&atlas, kf_2, pose_2, created);
        Ok(true)
    }

    fn start_tracking(&mut self, atlas: &Atlas, kf_id: KeyFrameId, pose: SE3, landmarks: usize) {
        self.pose = pose.clone();
        self.last_kf_pose = pose.clone();
        self.reference_kf = Some(kf_id);
        self.anchor = Some((kf_id, pose));
        self.generation = atlas.generation();
        self.kf_decision.start(landmarks);
    }

    fn reference_landmarks(&self) -> usize {
        let atlas = self.shared.atlas.read();
        self.reference_kf
            .and_then(|id| atlas.map().get_keyframe(id))
            .map_or(0, |kf| kf.num_map_points())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Predicted pose for the frame and whether the inertial prior was used.
    fn predict(&self, frame: &Frame, tf: &TrackingFrame) -> (SE3, bool) {
        let prior = match (self.config.imu.enabled, self.last_timestamp_ns) {
            (true, Some(prev)) => self.preintegrator.integrate(&frame.imu, prev, tf.timestamp_ns),
            _ => None,
        };
        if let Some(prior) = prior {
            if let Some(pose) = self.motion_model.predict_with_rotation(&prior.delta) {
                return (pose, true);
            }
        }
        if !frame.imu.is_empty() && prior.is_none() {
            debug!("[Tracking] {} ns: incomplete inertial coverage, constant velocity", tf.timestamp_ns);
        }
        (self.motion_model.predict().unwrap_or_else(|| self.pose.clone()), false)
    }

    /// Re-anchor to the map and track its local neighbourhood.
    fn track(&mut self, tf: &TrackingFrame, predicted: &SE3) -> Result<LocalMapTrack> {
        let shared = self.shared.clone();
        let atlas = shared.atlas.read();
        let predicted = self.reanchor(&atlas, predicted);

        // The newest keyframe is the reference once mapping inserted it.
        if let Some(last) = atlas.map().last_keyframe_id() {
            if self.reference_kf != Some(last) {
                self.reference_kf = Some(last);
            }
        }
        let Some(reference) = self.reference_kf.filter(|id| atlas.map().get_keyframe(*id).is_some()) else {
            return Err(SlamError::InsufficientMatches {
                found: 0,
                required: self.config.tracking.min_inliers,
            });
        };
        let track = self.track_local_map(&atlas, reference, tf, &predicted)?;
        if let Some(kf) = atlas.map().get_keyframe(reference) {
            self.anchor = Some((reference, kf.pose.clone()));
        }
        Ok(track)
    }

    /// Move the tracker's poses with the correction of its anchor keyframe
    /// when a pose-graph result was applied since the last frame.
    fn reanchor(&mut self, atlas: &Atlas, predicted: &SE3) -> SE3 {
        if atlas.generation() == self.generation {
            return predicted.clone();
        }
        self.generation = atlas.generation();
        let Some((kf_id, old_pose)) = self.anchor.clone() else {
            return predicted.clone();
        };
        let Some(kf) = atlas.map().get_keyframe(kf_id) else {
            return predicted.clone();
        };
        let correction = kf.pose.compose(&old_pose.inverse());
        self.pose = correction.compose(&self.pose);
        self.last_kf_pose = correction.compose(&self.last_kf_pose);
        self.motion_model.rebase(&self.pose);
        debug!(
            "[Tracking] re-anchored on {} after map correction ({:.3} m)",
            kf_id,
            correction.translation.norm()
        );
        correction.compose(predicted)
    }

    /// Project the local map's landmarks and solve the pose with RANSAC PnP.
    fn track_local_map(
        &self,
        atlas: &Atlas,
        reference: KeyFrameId,
        tf: &TrackingFrame,
        predicted: &SE3,
    ) -> Result<LocalMapTrack> {
        let map = atlas.map();
        let cfg = &self.config.tracking;

        let mut local_kfs = map.local_keyframes(reference, cfg.local_keyframes);
        local_kfs.push(reference);

        let pose_cw = predicted.inverse();
        let mut ids = Vec::new();
        let mut positions = Vec::new();
        let mut projections: Vec<(Vector2<f64>, &[u8])> = Vec::new();
        for mp_id in map.map_points_from_keyframes(&local_kfs) {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            let Some(uv) = self.camera.project(&pose_cw.transform_point(&mp.position)) else {
                continue;
            };
            if !self.camera.in_image(&uv, 0.0) {
                continue;
            }
            ids.push(mp_id);
            positions.push(mp.position);
            projections.push((uv, mp.descriptor.as_slice()));
        }

        let keypoints = &tf.features.keypoints;
        let descriptors = &tf.features.descriptors;
        let mut found = self
            .matcher
            .search_by_projection(&projections, keypoints, descriptors, cfg.search_radius_px);
        if found.len() < cfg.min_inliers * 2 {
            let wide = self
                .matcher
                .search_by_projection(&projections, keypoints, descriptors, cfg.wide_search_radius_px);
            if wide.len() > found.len() {
                found = wide;
            }
        }

        // Verification indexes pixels by `a` and points by `b`.
        let matches: Vec<Match> = found
            .iter()
            .map(|m| Match {
                a: m.b,
                b: m.a,
                distance: m.distance,
            })
            .collect();
        let pixels: Vec<Vector2<f64>> = keypoints.iter().map(|kp| kp.pt()).collect();
        let verified = self
            .matcher
            .verify_absolute_pose(&pixels, &positions, &matches, &self.camera, cfg.min_inliers)?;

        let verified = self.refine_with_local_map(&positions, &projections, tf, verified);

        let mut matched = vec![None; tf.num_features()];
        for m in &verified.inliers {
            matched[m.a] = Some(ids[m.b]);
        }
        Ok(LocalMapTrack {
            pose: verified.pose,
            matched,
            visible: ids,
            num_matches: verified.num_matches,
            num_inliers: verified.inliers.len(),
        })
    }

    /// Second pass: re-project the local map from the verified pose, match
    /// in a tight window and refine on every match with level weights. The
    /// RANSAC pose is kept when the refinement loses inliers.
    fn refine_with_local_map(
        &self,
        positions: &[Vector3<f64>],
        projections: &[(Vector2<f64>, &[u8])],
        tf: &TrackingFrame,
        verified: PoseVerification,
    ) -> PoseVerification {
        let pose_cw = verified.pose.inverse();
        let mut index = Vec::new();
        let mut reprojected: Vec<(Vector2<f64>, &[u8])> = Vec::new();
        for (i, (p, (_, desc))) in positions.iter().zip(projections).enumerate() {
            if let Some(uv) = self.camera.project(&pose_cw.transform_point(p)) {
                index.push(i);
                reprojected.push((uv, *desc));
            }
        }
        let found = self.matcher.search_by_projection(
            &reprojected,
            &tf.features.keypoints,
            &tf.features.descriptors,
            self.config.tracking.refine_search_radius_px,
        );
        let matches: Vec<Match> = found
            .iter()
            .map(|m| Match {
                a: m.b,
                b: index[m.a],
                distance: m.distance,
            })
            .collect();

        let scale = LevelScale::new(self.config.extractor.scale_factor);
        let pixels: Vec<Vector2<f64>> = tf.features.keypoints.iter().map(|kp| kp.pt()).collect();
        let weights: Vec<f64> = tf.features.keypoints.iter().map(|kp| 1.0 / scale.sigma2(kp.level)).collect();
        let refined = self
            .matcher
            .refine_absolute_pose(&verified.pose, &pixels, &weights, positions, &matches, &self.camera);
        if refined.inliers.len() < verified.inliers.len() {
            debug!(
                "[Tracking] pose refinement kept RANSAC pose: {} < {} inliers",
                refined.inliers.len(),
                verified.inliers.len()
            );
            return verified;
        }
        PoseVerification {
            num_matches: verified.num_matches.max(refined.num_matches),
            ..refined
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relocalization
    // ─────────────────────────────────────────────────────────────────────────

    /// Relocalize against the whole map. Returns the inlier count.
    fn relocalize(&mut self, tf: &TrackingFrame) -> Result<usize> {
        let atlas = self.shared.atlas.read();
        let found = locate(
            &atlas,
            &tf.features,
            &self.camera,
            &self.matcher,
            &self.config.relocalization,
        )?;
        let inliers = found.verification.inliers.len();
        if inliers < self.config.tracking.min_inliers {
            return Err(SlamError::InsufficientMatches {
                found: inliers,
                required: self.config.tracking.min_inliers,
            });
        }
        self.pose = found.verification.pose.clone();
        self.motion_model.reset();
        self.reference_kf = Some(found.keyframe);
        if let Some(kf) = atlas.map().get_keyframe(found.keyframe) {
            self.anchor = Some((found.keyframe, kf.pose.clone()));
            self.last_kf_pose = kf.pose.clone();
        }
        self.generation = atlas.generation();
        info!(
            "[Tracking] relocalized against {} with {} inliers",
            found.keyframe, inliers
        );
        Ok(inliers)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame creation
    // ─────────────────────────────────────────────────────────────────────────

    /// Decide whether to create a new keyframe, and if so, send it to Local Mapping.
    fn maybe_create_keyframe(&mut self, tf: &TrackingFrame, track: &LocalMapTrack) -> KeyFrameVerdict {
        let quality = FrameQuality {
            num_features: tf.num_features(),
            num_inliers: track.num_inliers,
        };
        let verdict = self.kf_decision.decide(&self.pose, &self.last_kf_pose, quality);
        if verdict == KeyFrameVerdict::LowTexture {
            SessionStats::incr(&self.shared.stats.keyframes_rejected);
            debug!(
                "[Tracking] {} ns: keyframe gate fired on a poor frame ({} features, {} inliers)",
                tf.timestamp_ns, quality.num_features, quality.num_inliers
            );
        }
        if !verdict.accepted() {
            return verdict;
        }

        // Don't create keyframes if flow control says to stop
        if self.config.system.mode == ProcessingMode::Realtime && self.shared.should_stop_keyframe_creation() {
            return KeyFrameVerdict::NotNeeded;
        }

        let msg = NewKeyFrameMsg {
            keyframe: new_keyframe(tf, self.pose.clone()),
            matched_map_points: track.matched.clone(),
            visible_map_points: track.visible.clone(),
        };
        if !self.send_keyframe(msg) {
            return KeyFrameVerdict::NotNeeded;
        }
        self.last_kf_pose = self.pose.clone();
        self.kf_decision.reset(track.num_inliers);
        verdict
    }

    fn send_keyframe(&mut self, msg: NewKeyFrameMsg) -> bool {
        match self.config.system.mode {
            ProcessingMode::Realtime => match self.kf_sender.try_send(msg) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("[Tracking] keyframe queue full");
                    false
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("[Tracking] local mapping is gone");
                    false
                }
            },
            ProcessingMode::Offline => {
                if self.kf_sender.send(msg).is_err() {
                    warn!("[Tracking] local mapping is gone");
                    return false;
                }
                self.keyframes_sent += 1;
                let timeout = Duration::from_millis(self.config.system.mapped_wait_ms);
                if !self.shared.wait_mapped(self.keyframes_sent, timeout) {
                    warn!("[Tracking] keyframe {} not mapped within {:?}", self.keyframes_sent, timeout);
                }
                true
            }
        }
    }
}

fn new_keyframe(tf: &TrackingFrame, pose: SE3) -> NewKeyFrame {
    NewKeyFrame {
        timestamp_ns: tf.timestamp_ns,
        pose,
        features: tf.features.clone(),
        depths: tf.depths.clone(),
        colors: tf.colors.clone(),
        dense: tf.dense.clone(),
    }
}
