//! Local Mapper - Main Local Mapping thread implementation.
//!
//! Processes keyframes received from Tracking:
//! 1. Inserts keyframe into the map and the vocabulary
//! 2. Associates matched map points
//! 3. Back-projects trusted depth into new landmarks
//! 4. Triangulates new landmarks against neighbour keyframes
//! 5. Fuses neighbour landmarks into the new keyframe
//! 6. Refines the sliding window's landmarks
//! 7. Culls recently created landmarks (and optionally redundant keyframes)
//! 8. Runs the local pose graph
//! 9. Forwards the keyframe to Loop Closing unless backlogged

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, LandmarkOrigin, Map, MapPointId};
use crate::config::SlamConfig;
use crate::error::{Result, SlamError};
use crate::optimizer::pose_graph;
use crate::system::messages::{LoopQueryMsg, NewKeyFrameMsg};
use crate::system::shared_state::{SessionStats, SharedState};
use crate::tracking::frame::CalibratedCamera;
use crate::tracking::matching::DescriptorMatcher;

use super::refinement::{apply_refinements, collect_window, fuse_observation, solve_window, RefinementConfig};
use super::triangulation::{back_project_keyframe, triangulate_from_neighbors, LevelScale, TriangulationConfig};

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Local mapping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub triangulation: TriangulationConfig,
    pub refinement: RefinementConfig,

    /// Landmarks whose found/visible ratio drops below this are culled.
    /// Default: 0.25
    pub cull_min_found_ratio: f64,

    /// Keyframes a new landmark stays under observation before it is
    /// considered established.
    /// Default: 3
    pub cull_grace_keyframes: u64,

    /// Observations a triangulated landmark must keep once it is two
    /// keyframes old.
    /// Default: 2
    pub cull_min_observations: usize,

    /// Remove keyframes whose landmarks are almost all seen elsewhere.
    /// Default: false
    pub cull_redundant_keyframes: bool,

    /// Fraction of a keyframe's landmarks observed by 3+ other keyframes
    /// above which it is redundant.
    /// Default: 0.9
    pub redundancy_threshold: f64,

    /// Search radius when fusing neighbour landmarks, pixels.
    /// Default: 4.0
    pub fuse_radius_px: f64,

    /// Queued keyframes above which Tracking stops creating keyframes and
    /// loop search is skipped.
    /// Default: 3
    pub max_backlog: usize,

    /// Soft per-keyframe time budget; loop search is skipped past it.
    /// Default: 500
    pub time_budget_ms: u64,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            triangulation: TriangulationConfig::default(),
            refinement: RefinementConfig::default(),
            cull_min_found_ratio: 0.25,
            cull_grace_keyframes: 3,
            cull_min_observations: 2,
            cull_redundant_keyframes: false,
            redundancy_threshold: 0.9,
            fuse_radius_px: 4.0,
            max_backlog: 3,
            time_budget_ms: 500,
        }
    }
}

impl MappingConfig {
    pub fn validate(&self) -> Result<()> {
        self.triangulation.validate()?;
        self.refinement.validate()?;
        if !(0.0..=1.0).contains(&self.cull_min_found_ratio) {
            return Err(SlamError::Config("mapping.cull_min_found_ratio must be in [0, 1]".into()));
        }
        if !(self.redundancy_threshold > 0.0 && self.redundancy_threshold <= 1.0) {
            return Err(SlamError::Config("mapping.redundancy_threshold must be in (0, 1]".into()));
        }
        if self.fuse_radius_px <= 0.0 {
            return Err(SlamError::Config("mapping.fuse_radius_px must be positive".into()));
        }
        if self.max_backlog == 0 {
            return Err(SlamError::Config("mapping.max_backlog must be positive".into()));
        }
        Ok(())
    }
}

/// A landmark created recently, still on probation.
#[derive(Debug, Clone, Copy)]
struct RecentPoint {
    id: MapPointId,
    created_at: KeyFrameId,
    origin: LandmarkOrigin,
}

/// Local Mapping thread state.
pub struct LocalMapper {
    camera: CalibratedCamera,
    config: Arc<SlamConfig>,
    matcher: DescriptorMatcher,
    scale: LevelScale,

    /// Landmarks created in the last few keyframes.
    recent_points: VecDeque<RecentPoint>,

    /// Channel sender to Loop Closing thread.
    lc_sender: Option<Sender<LoopQueryMsg>>,
}

impl LocalMapper {
    /// Create a new LocalMapper.
    ///
    /// # Arguments
    /// * `camera` - Calibration of the session's map
    /// * `config` - Validated session configuration
    /// * `lc_sender` - Optional sender to forward keyframes to Loop Closing
    pub fn new(camera: CalibratedCamera, config: Arc<SlamConfig>, lc_sender: Option<Sender<LoopQueryMsg>>) -> Self {
        let matcher = DescriptorMatcher::new(config.matcher.clone());
        let scale = LevelScale::new(config.extractor.scale_factor);
        Self {
            camera,
            config,
            matcher,
            scale,
            recent_points: VecDeque::new(),
            lc_sender,
        }
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// Runs until shutdown is requested or the channel is closed and drained.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>, shared: Arc<SharedState>) {
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            // Update flow control based on queue size
            let queue_len = kf_receiver.len();
            shared.set_stop_keyframe_creation(queue_len > self.config.mapping.max_backlog);

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    let backlog = kf_receiver.len();
                    self.process_keyframe(msg, backlog, &shared);
                    shared.notify_mapped();
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        shared.set_stop_keyframe_creation(false);
        debug!("[LocalMapping] exiting");
    }

    /// Process a single keyframe message. `backlog` is the number of
    /// keyframes still queued behind it.
    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg, backlog: usize, shared: &SharedState) {
        let started = Instant::now();

        // Step 1: Insert keyframe into the map
        let Some(kf_id) = self.insert_keyframe(&msg, shared) else {
            return;
        };

        // Step 2: Associate existing map point matches
        self.associate_matched_points(&msg, kf_id, shared);

        // Step 3: Landmarks from trusted depth
        self.back_project_depth(kf_id, shared);

        // Step 4: Two-view triangulation against neighbours
        self.triangulate_from_neighbors(kf_id, shared);

        // Step 5: Fuse neighbour landmarks into this keyframe
        self.fuse_neighbor_points(kf_id, shared);

        // Step 6: Sliding-window landmark refinement
        self.refine_window(kf_id, shared);

        // Step 7: Cull bad map points and redundant keyframes
        self.cull_map_points(kf_id, shared);
        if self.config.mapping.cull_redundant_keyframes {
            self.cull_keyframes(kf_id, shared);
        }

        // Step 8: Incremental pose graph over the recent window
        self.local_pose_graph(kf_id, shared);

        // Step 9: Send keyframe to Loop Closing (optional work, skipped first)
        let budget = Duration::from_millis(self.config.mapping.time_budget_ms);
        if backlog > self.config.mapping.max_backlog || started.elapsed() > budget {
            SessionStats::incr(&shared.stats.skipped_loop_searches);
            warn!(
                "[LocalMapping] {}: skipping loop search (backlog={}, elapsed={:?})",
                kf_id,
                backlog,
                started.elapsed()
            );
        } else if let Some(ref sender) = self.lc_sender {
            if let Err(TrySendError::Full(_)) = sender.try_send(LoopQueryMsg { kf_id }) {
                SessionStats::incr(&shared.stats.skipped_loop_searches);
                debug!("[LocalMapping] {}: loop queue full", kf_id);
            }
        }
    }

    /// Insert the keyframe into the map. Logs and returns None if the
    /// keyframe cannot be inserted.
    fn insert_keyframe(&self, msg: &NewKeyFrameMsg, shared: &SharedState) -> Option<KeyFrameId> {
        let mut atlas = shared.atlas.write();
        match atlas.insert_keyframe(msg.keyframe.clone()) {
            Ok(id) => {
                info!(
                    "[LocalMapping] inserted {} ({} keyframes, {} landmarks)",
                    id,
                    atlas.num_keyframes(),
                    atlas.map().num_map_points()
                );
                Some(id)
            }
            Err(e) => {
                warn!("[LocalMapping] keyframe rejected: {}", e);
                SessionStats::incr(&shared.stats.keyframes_rejected);
                None
            }
        }
    }

    /// Associate map points that were matched during tracking.
    fn associate_matched_points(&self, msg: &NewKeyFrameMsg, kf_id: KeyFrameId, shared: &SharedState) {
        let mut atlas = shared.atlas.write();
        let map = atlas.map_mut();

        for mp_id in &msg.visible_map_points {
            if let Some(mp) = map.get_map_point_mut(*mp_id) {
                mp.increase_visible();
            }
        }
        let mut associated = 0;
        for (feat_idx, mp_id_opt) in msg.matched_map_points.iter().enumerate() {
            if let Some(mp_id) = mp_id_opt {
                // Create bidirectional association (also updates covisibility)
                if map.associate(kf_id, feat_idx, *mp_id) {
                    if let Some(mp) = map.get_map_point_mut(*mp_id) {
                        mp.increase_found();
                    }
                    map.update_map_point_normal(*mp_id);
                    associated += 1;
                }
            }
        }
        debug!("[LocalMapping] {}: associated {} tracked landmarks", kf_id, associated);
    }

    /// Create landmarks from features with a trusted depth reading.
    fn back_project_depth(&mut self, kf_id: KeyFrameId, shared: &SharedState) {
        let created = {
            let mut atlas = shared.atlas.write();
            let map = atlas.map_mut();
            if !map.get_keyframe(kf_id).is_some_and(|kf| kf.has_depth()) {
                return;
            }
            back_project_keyframe(map, &self.camera, kf_id, &self.config.depth)
        };
        debug!("[DepthLandmarks] {}: {} landmarks", kf_id, created.len());
        self.track_recent(created, kf_id, LandmarkOrigin::DepthBackProjected);
    }

    /// Multi-frame triangulation with geometric validation.
    ///
    /// Failures are logged and skip this step; the keyframe itself is kept.
    fn triangulate_from_neighbors(&mut self, kf_id: KeyFrameId, shared: &SharedState) {
        let result = {
            let mut atlas = shared.atlas.write();
            triangulate_from_neighbors(
                atlas.map_mut(),
                kf_id,
                &self.matcher,
                &self.camera,
                self.scale,
                &self.config.mapping.triangulation,
            )
        };
        match result {
            Ok(stats) => self.track_recent(stats.created, kf_id, LandmarkOrigin::Triangulated),
            Err(e) => warn!("[Triangulation] {}: skipped ({})", kf_id, e),
        }
    }

    /// Project the neighbours' landmarks into the new keyframe and fuse
    /// every confident match.
    fn fuse_neighbor_points(&self, kf_id: KeyFrameId, shared: &SharedState) {
        let mut atlas = shared.atlas.write();
        let map = atlas.map_mut();

        let pairs = fuse_candidates(
            map,
            kf_id,
            &self.matcher,
            &self.camera,
            self.config.mapping.triangulation.num_neighbors,
            self.config.mapping.fuse_radius_px,
        );
        let mut fused = 0;
        for (mp_id, feat_idx) in pairs {
            match fuse_observation(
                map,
                &self.camera,
                self.scale,
                mp_id,
                kf_id,
                feat_idx,
                &self.config.mapping.refinement,
            ) {
                Ok(_) => fused += 1,
                Err(e) => debug!("[Fuse] {} feature {}: {}", mp_id, feat_idx, e),
            }
        }
        if fused > 0 {
            debug!("[Fuse] {}: fused {} landmarks", kf_id, fused);
        }
    }

    /// Sliding-window refinement using three-phase locking.
    ///
    /// 1. **COLLECT**: read lock to snapshot the window's landmarks
    /// 2. **SOLVE**: no lock held
    /// 3. **APPLY**: write lock, skipped if a pose batch landed meanwhile
    fn refine_window(&self, kf_id: KeyFrameId, shared: &SharedState) {
        let (landmarks, generation) = {
            let atlas = shared.atlas.read();
            (
                collect_window(atlas.map(), kf_id, self.scale, &self.config.mapping.refinement),
                atlas.generation(),
            )
        };
        if landmarks.is_empty() {
            return;
        }

        let refined = solve_window(&landmarks, &self.camera, &self.config.mapping.refinement);

        let mut atlas = shared.atlas.write();
        if atlas.generation() != generation {
            debug!("[Refinement] {}: poses changed during solve, discarded", kf_id);
            return;
        }
        let moved = apply_refinements(atlas.map_mut(), &refined);
        debug!("[Refinement] {}: {} of {} landmarks refined", kf_id, moved, landmarks.len());
    }

    /// Cull recently created map points.
    ///
    /// A recent point is removed when:
    /// - its found/visible ratio is below `cull_min_found_ratio`
    /// - it was triangulated, is two or more keyframes old and has fewer
    ///   than `cull_min_observations` observations left
    ///
    /// Points leave probation after `cull_grace_keyframes` keyframes.
    fn cull_map_points(&mut self, current_kf_id: KeyFrameId, shared: &SharedState) {
        let cfg = &self.config.mapping;
        let mut atlas = shared.atlas.write();
        let map = atlas.map_mut();

        let mut culled = 0;
        let mut kept = VecDeque::with_capacity(self.recent_points.len());
        for point in self.recent_points.drain(..) {
            let Some(mp) = map.get_map_point(point.id) else {
                continue;
            };
            let age = current_kf_id.0.saturating_sub(point.created_at.0);
            let bad = mp.found_ratio() < cfg.cull_min_found_ratio
                || (point.origin == LandmarkOrigin::Triangulated
                    && age >= 2
                    && mp.num_observations() < cfg.cull_min_observations);
            if bad {
                map.remove_map_point_full(point.id);
                culled += 1;
            } else if age < cfg.cull_grace_keyframes {
                kept.push_back(point);
            }
        }
        self.recent_points = kept;

        if culled > 0 {
            debug!(
                "[MapCulling] Removed {} bad map points (remaining: {})",
                culled,
                map.num_map_points()
            );
        }
    }

    /// Cull redundant keyframes.
    ///
    /// Removes covisible keyframes where more than `redundancy_threshold`
    /// of their landmarks are observed by at least 3 other keyframes.
    /// Never removes the first keyframe, the current one, or keyframes
    /// holding a loop edge.
    fn cull_keyframes(&self, current_kf_id: KeyFrameId, shared: &SharedState) {
        const MIN_OBSERVATIONS_PER_POINT: usize = 3;

        let mut atlas = shared.atlas.write();
        let map = atlas.map();

        let Some(current) = map.get_keyframe(current_kf_id) else {
            return;
        };
        let mut to_cull = Vec::new();
        for kf_id in current.covisibility_weights().keys().copied() {
            if kf_id >= current_kf_id || map.loop_edges().any(|e| e.connects(kf_id)) {
                continue;
            }
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            if kf.prev_kf.is_none() {
                continue;
            }

            let mut redundant = 0;
            let mut total = 0;
            for (_, mp_id) in kf.get_map_point_indices() {
                let Some(mp) = map.get_map_point(mp_id) else {
                    continue;
                };
                total += 1;
                let elsewhere = mp.observations.keys().filter(|&&o| o != kf_id).count();
                if elsewhere >= MIN_OBSERVATIONS_PER_POINT {
                    redundant += 1;
                }
            }
            if total > 0 && redundant as f64 / total as f64 > self.config.mapping.redundancy_threshold {
                to_cull.push(kf_id);
            }
        }

        let num_culled = to_cull.len();
        for kf_id in to_cull {
            atlas.remove_keyframe(kf_id);
        }
        if num_culled > 0 {
            info!(
                "[KFCulling] Removed {} redundant keyframes (remaining: {})",
                num_culled,
                atlas.num_keyframes()
            );
        }
    }

    /// Local pose graph around the new keyframe, three-phase like the
    /// refinement. Skipped while a global optimization is pending.
    fn local_pose_graph(&self, kf_id: KeyFrameId, shared: &SharedState) {
        if shared.is_global_pending() {
            return;
        }
        let cfg = &self.config.pose_graph;
        let Some(problem) = ({
            let atlas = shared.atlas.read();
            pose_graph::collect_local(atlas.map(), kf_id, cfg)
        }) else {
            return;
        };

        let should_stop = || shared.is_global_pending();
        let Some(result) = pose_graph::solve(&problem, cfg, &should_stop) else {
            return;
        };

        let mut atlas = shared.atlas.write();
        match pose_graph::apply(atlas.map_mut(), &result) {
            Some(n) => debug!(
                "[LocalPoseGraph] {}: {} poses, error {:.3e} -> {:.3e}",
                kf_id, n, result.initial_error, result.final_error
            ),
            None => debug!("[LocalPoseGraph] {}: stale result discarded", kf_id),
        }
    }

    fn track_recent(&mut self, ids: Vec<MapPointId>, kf_id: KeyFrameId, origin: LandmarkOrigin) {
        self.recent_points.extend(ids.into_iter().map(|id| RecentPoint {
            id,
            created_at: kf_id,
            origin,
        }));
    }
}

/// Neighbour landmarks matched to free features of `kf_id` by projection.
/// Returns (landmark, feature index) pairs.
fn fuse_candidates(
    map: &Map,
    kf_id: KeyFrameId,
    matcher: &DescriptorMatcher,
    camera: &CalibratedCamera,
    num_neighbors: usize,
    radius: f64,
) -> Vec<(MapPointId, usize)> {
    let Some(kf) = map.get_keyframe(kf_id) else {
        return Vec::new();
    };
    let neighbours = map.local_keyframes(kf_id, num_neighbors);
    let pose_cw = kf.pose_cw();

    let mut ids = Vec::new();
    let mut projections: Vec<(Vector2<f64>, &[u8])> = Vec::new();
    for mp_id in map.map_points_from_keyframes(&neighbours) {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        if mp.is_observed_by(kf_id) {
            continue;
        }
        let p_c = pose_cw.transform_point(&mp.position);
        let Some(uv) = camera.project(&p_c) else {
            continue;
        };
        if !camera.in_image(&uv, 0.0) {
            continue;
        }
        ids.push(mp_id);
        projections.push((uv, mp.descriptor.as_slice()));
    }
    if projections.is_empty() {
        return Vec::new();
    }

    matcher
        .search_by_projection(&projections, &kf.keypoints, &kf.descriptors, radius)
        .into_iter()
        .map(|m| (ids[m.a], m.b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::NewKeyFrame;
    use crate::atlas::Atlas;
    use crate::geometry::SE3;
    use crate::tracking::frame::{Descriptors, FeatureSet, KeyPoint};
    use crate::vocabulary::VocabularyConfig;
    use nalgebra::{UnitQuaternion, Vector3};

    fn camera() -> CalibratedCamera {
        CalibratedCamera::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240)
    }

    /// A grid of points at 3 m depth with distinct descriptors.
    fn scene() -> Vec<(Vector3<f64>, [u8; 32])> {
        let mut out = Vec::new();
        for i in 0..8 {
            for j in 0..6 {
                let p = Vector3::new(-1.4 + 0.4 * i as f64, -0.9 + 0.35 * j as f64, 3.0 + 0.1 * ((i + j) % 3) as f64);
                let mut d = [0u8; 32];
                for (k, b) in d.iter_mut().enumerate() {
                    *b = ((i * 37 + j * 91 + k * 13) % 251) as u8 ^ ((k as u8).wrapping_mul(i as u8 + 3));
                }
                out.push((p, d));
            }
        }
        out
    }

    fn keyframe(x: f64, with_depth: bool) -> NewKeyFrame {
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0));
        let cam = camera();
        let mut kps = Vec::new();
        let mut rows = Vec::new();
        let mut depths = Vec::new();
        for (p, d) in scene() {
            let pc = pose.inverse().transform_point(&p);
            if let Some(uv) = cam.project(&pc).filter(|uv| cam.in_image(uv, 0.0)) {
                kps.push(KeyPoint { x: uv.x as f32, y: uv.y as f32, level: 0, angle: 0.0, response: 1.0 });
                rows.push(d);
                depths.push(with_depth.then_some(pc.z));
            }
        }
        let n = kps.len();
        NewKeyFrame {
            timestamp_ns: (x * 1e9) as u64,
            pose,
            features: FeatureSet { keypoints: kps, descriptors: Descriptors::from_rows(32, &rows).unwrap() },
            depths,
            colors: vec![[128, 128, 128]; n],
            dense: None,
        }
    }

    fn setup() -> (Arc<SharedState>, LocalMapper) {
        let shared = SharedState::new(Atlas::new(camera(), 32, VocabularyConfig::default()).unwrap());
        let mapper = LocalMapper::new(camera(), Arc::new(SlamConfig::default()), None);
        (shared, mapper)
    }

    fn msg(kf: NewKeyFrame) -> NewKeyFrameMsg {
        let n = kf.features.len();
        NewKeyFrameMsg { keyframe: kf, matched_map_points: vec![None; n], visible_map_points: Vec::new() }
    }

    #[test]
    fn test_depth_keyframe_creates_landmarks() {
        let (shared, mut mapper) = setup();
        mapper.process_keyframe(msg(keyframe(0.0, true)), 0, &shared);
        let atlas = shared.atlas.read();
        assert_eq!(atlas.num_keyframes(), 1);
        assert!(atlas.map().num_map_points() > 30);
        atlas.check_integrity().unwrap();
    }

    #[test]
    fn test_monocular_keyframes_triangulate_against_neighbour() {
        let (shared, mut mapper) = setup();
        mapper.process_keyframe(msg(keyframe(0.0, false)), 0, &shared);
        assert_eq!(shared.atlas.read().map().num_map_points(), 0);
        mapper.process_keyframe(msg(keyframe(0.3, false)), 0, &shared);
        let atlas = shared.atlas.read();
        assert!(atlas.map().num_map_points() > 20);
        for mp in atlas.map().map_points() {
            assert!(mp.position.z > 2.5 && mp.position.z < 3.5);
        }
    }

    #[test]
    fn test_matched_points_are_associated_and_fused() {
        let (shared, mut mapper) = setup();
        mapper.process_keyframe(msg(keyframe(0.0, true)), 0, &shared);
        let before = shared.atlas.read().map().num_map_points();
        // Second keyframe carries no matches: fusion must find the shared landmarks.
        mapper.process_keyframe(msg(keyframe(0.1, false)), 0, &shared);
        let atlas = shared.atlas.read();
        let kf1 = atlas.map().get_keyframe(KeyFrameId(1)).unwrap();
        assert!(kf1.num_map_points() > before / 2);
        assert_eq!(atlas.map().num_map_points(), before);
        atlas.check_integrity().unwrap();
    }

    #[test]
    fn test_rejected_keyframe_is_counted() {
        let (shared, mut mapper) = setup();
        let mut kf = keyframe(0.0, true);
        let rows: Vec<[u8; 64]> = (0..kf.features.len()).map(|i| [i as u8; 64]).collect();
        kf.features.descriptors = Descriptors::from_rows(64, &rows).unwrap();
        mapper.process_keyframe(msg(kf), 0, &shared);
        assert_eq!(shared.atlas.read().num_keyframes(), 0);
        assert_eq!(shared.stats.snapshot().keyframes_rejected, 1);
    }

    #[test]
    fn test_backlog_skips_loop_search() {
        let (shared, _) = setup();
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut mapper = LocalMapper::new(camera(), Arc::new(SlamConfig::default()), Some(tx));
        mapper.process_keyframe(msg(keyframe(0.0, true)), 10, &shared);
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.stats.snapshot().skipped_loop_searches, 1);
        mapper.process_keyframe(msg(keyframe(0.1, true)), 0, &shared);
        assert_eq!(rx.try_recv().unwrap().kf_id, KeyFrameId(1));
    }

    #[test]
    fn test_config_validation() {
        assert!(MappingConfig::default().validate().is_ok());
        let cfg = MappingConfig { max_backlog: 0, ..MappingConfig::default() };
        assert!(cfg.validate().is_err());
    }
}
