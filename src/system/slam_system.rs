//! SLAM session - main entry point and thread orchestration.
//!
//! A `SlamSession` is the handle of one mapping session. It owns the shared
//! state and the worker threads:
//! - Tracking (caller thread in Offline mode, dedicated thread in Realtime)
//! - Local Mapping
//! - Loop Closing
//! - Global pose-graph optimization
//!
//! Sessions are independent: nothing here is process-global.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::atlas::Atlas;
use crate::config::{ProcessingMode, SlamConfig};
use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::local_mapping::LocalMapper;
use crate::loop_closing::{GlobalOptimizer, LoopCloser, LoopClosure};
use crate::tracking::frame::{CalibratedCamera, Frame};
use crate::tracking::{Tracker, TrackingResult, TrackingState};

use super::frame_buffer::{Admission, ReorderBuffer};
use super::messages::{LoopQueryMsg, NewKeyFrameMsg, OptimizationRequest};
use super::shared_state::{SessionStats, SharedState, StatsSnapshot};

/// Queue of global optimization requests. Requests are coalesced by the
/// optimizer, so a short queue is enough.
const OPTIMIZATION_QUEUE_CAPACITY: usize = 4;

/// Outcome of ingesting one frame.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub admission: Admission,
    /// Frames tracked during this call (Offline mode), oldest first.
    pub results: Vec<TrackingResult>,
}

/// Per-frame tracking history shared with the tracking thread.
#[derive(Debug, Default)]
struct TrackingLog {
    last: Option<TrackingResult>,
    /// Frames that produced a pose.
    trajectory: Vec<(u64, SE3)>,
    frames_tracked: usize,
}

impl TrackingLog {
    fn record(&mut self, result: &TrackingResult) {
        self.frames_tracked += 1;
        if result.state.has_pose() {
            self.trajectory.push((result.timestamp_ns, result.pose.clone()));
        }
        self.last = Some(result.clone());
    }
}

/// How frames reach the tracker.
enum TrackingDriver {
    Inline(Box<Tracker>),
    Threaded {
        frames: Sender<Frame>,
        handle: JoinHandle<Tracker>,
    },
}

/// Everything a finished session produced.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    #[serde(skip)]
    pub atlas: Atlas,
    pub stats: StatsSnapshot,
    pub frames_tracked: usize,
    pub lost_transitions: usize,
    pub loops: Vec<LoopClosure>,
    /// Timestamp and pose of every tracked frame, as estimated online.
    pub trajectory: Vec<(u64, SE3)>,
}

/// Handle of one mapping session.
pub struct SlamSession {
    shared: Arc<SharedState>,
    config: Arc<SlamConfig>,
    camera: CalibratedCamera,
    reorder: ReorderBuffer,
    driver: Option<TrackingDriver>,
    log: Arc<Mutex<TrackingLog>>,

    local_mapping_handle: Option<JoinHandle<()>>,
    loop_closing_handle: Option<JoinHandle<()>>,
    optimizer_handle: Option<JoinHandle<()>>,
}

/// Start a mapping session with the given calibration.
///
/// Configuration and calibration errors are fatal and abort the start.
pub fn start_session(camera: CalibratedCamera, config: SlamConfig) -> Result<SlamSession> {
    SlamSession::start(camera, config)
}

impl SlamSession {
    pub fn start(camera: CalibratedCamera, config: SlamConfig) -> Result<Self> {
        config.validate()?;
        camera.validate()?;
        let config = Arc::new(config);
        let atlas = Atlas::new(camera.clone(), config.extractor.descriptor_len, config.vocabulary.clone())?;
        let shared = SharedState::new(atlas);

        let sys = &config.system;
        let (kf_sender, kf_receiver) = bounded::<NewKeyFrameMsg>(sys.keyframe_queue_capacity);
        let (lc_sender, lc_receiver) = bounded::<LoopQueryMsg>(sys.loop_queue_capacity);
        let (opt_sender, opt_receiver) = bounded::<OptimizationRequest>(OPTIMIZATION_QUEUE_CAPACITY);

        let tracker = Tracker::new(camera.clone(), config.clone(), shared.clone(), kf_sender)?;
        let log = Arc::new(Mutex::new(TrackingLog::default()));

        let local_mapping_handle =
            Self::spawn_local_mapping(shared.clone(), kf_receiver, camera.clone(), config.clone(), lc_sender)?;
        let loop_closing_handle =
            Self::spawn_loop_closing(shared.clone(), lc_receiver, camera.clone(), config.clone(), opt_sender)?;
        let optimizer_handle = Self::spawn_optimizer(shared.clone(), opt_receiver, config.clone())?;

        let driver = match sys.mode {
            ProcessingMode::Offline => TrackingDriver::Inline(Box::new(tracker)),
            ProcessingMode::Realtime => {
                let (frames, frame_receiver) = bounded::<Frame>(sys.frame_queue_capacity);
                let handle = Self::spawn_tracking(tracker, frame_receiver, shared.clone(), log.clone())?;
                TrackingDriver::Threaded { frames, handle }
            }
        };

        info!(
            "[Session] started: {}x{}, {:?} mode, {}-byte descriptors, depth {:?}",
            camera.width, camera.height, sys.mode, config.extractor.descriptor_len, sys.depth_source
        );

        Ok(Self {
            reorder: ReorderBuffer::new(sys.reorder_window_ns, sys.reorder_capacity),
            shared,
            config,
            camera,
            driver: Some(driver),
            log,
            local_mapping_handle: Some(local_mapping_handle),
            loop_closing_handle: Some(loop_closing_handle),
            optimizer_handle: Some(optimizer_handle),
        })
    }

    fn spawn_local_mapping(
        shared: Arc<SharedState>,
        kf_receiver: Receiver<NewKeyFrameMsg>,
        camera: CalibratedCamera,
        config: Arc<SlamConfig>,
        lc_sender: Sender<LoopQueryMsg>,
    ) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new().name("local-mapping".into()).spawn(move || {
            let mut local_mapper = LocalMapper::new(camera, config, Some(lc_sender));
            local_mapper.run(kf_receiver, shared);
        })?;
        Ok(handle)
    }

    fn spawn_loop_closing(
        shared: Arc<SharedState>,
        lc_receiver: Receiver<LoopQueryMsg>,
        camera: CalibratedCamera,
        config: Arc<SlamConfig>,
        opt_sender: Sender<OptimizationRequest>,
    ) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new().name("loop-closing".into()).spawn(move || {
            let mut loop_closer = LoopCloser::new(shared, camera, config, Some(opt_sender));
            loop_closer.run(lc_receiver);
        })?;
        Ok(handle)
    }

    fn spawn_optimizer(
        shared: Arc<SharedState>,
        opt_receiver: Receiver<OptimizationRequest>,
        config: Arc<SlamConfig>,
    ) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new().name("pose-graph".into()).spawn(move || {
            let mut optimizer = GlobalOptimizer::new(shared, config.pose_graph.clone());
            optimizer.run(opt_receiver);
        })?;
        Ok(handle)
    }

    fn spawn_tracking(
        mut tracker: Tracker,
        frames: Receiver<Frame>,
        shared: Arc<SharedState>,
        log: Arc<Mutex<TrackingLog>>,
    ) -> Result<JoinHandle<Tracker>> {
        let handle = thread::Builder::new().name("tracking".into()).spawn(move || {
            for frame in frames.iter() {
                match tracker.process_frame(&frame) {
                    Ok(result) => log.lock().record(&result),
                    Err(e) => {
                        SessionStats::incr(&shared.stats.invalid_frames);
                        warn!("[Session] frame {} skipped: {}", frame.timestamp_ns, e);
                    }
                }
            }
            tracker
        })?;
        Ok(handle)
    }

    /// Feed one frame.
    ///
    /// Frames with corrupted data are rejected here with `InvalidFrame`
    /// (or `Calibration` for a resolution mismatch) and the session carries
    /// on. Late frames are dropped and reported through `admission`.
    pub fn ingest(&mut self, frame: Frame) -> Result<Ingested> {
        SessionStats::incr(&self.shared.stats.frames_received);
        if self.driver.is_none() {
            return Err(SlamError::SessionClosed);
        }
        if let Err(e) = self.check_frame(&frame) {
            SessionStats::incr(&self.shared.stats.invalid_frames);
            warn!("[Session] frame {} rejected: {}", frame.timestamp_ns, e);
            return Err(e);
        }

        let ts = frame.timestamp_ns;
        let admission = self.reorder.push(frame);
        if admission != Admission::Buffered {
            SessionStats::incr(&self.shared.stats.late_frames);
            debug!("[Session] frame {} dropped: {:?}", ts, admission);
        }
        let ready = self.reorder.pop_ready();
        let results = self.dispatch(ready)?;
        Ok(Ingested { admission, results })
    }

    fn check_frame(&self, frame: &Frame) -> Result<()> {
        frame.validate()?;
        let (w, h) = frame.color.dimensions();
        if (w, h) != (self.camera.width, self.camera.height) {
            return Err(SlamError::Calibration(format!(
                "frame is {}x{}, calibration expects {}x{}",
                w, h, self.camera.width, self.camera.height
            )));
        }
        Ok(())
    }

    fn dispatch(&mut self, frames: Vec<Frame>) -> Result<Vec<TrackingResult>> {
        let mut results = Vec::new();
        match self.driver.as_mut() {
            Some(TrackingDriver::Inline(tracker)) => {
                for frame in frames {
                    match tracker.process_frame(&frame) {
                        Ok(result) => {
                            self.log.lock().record(&result);
                            results.push(result);
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            SessionStats::incr(&self.shared.stats.invalid_frames);
                            warn!("[Session] frame {} skipped: {}", frame.timestamp_ns, e);
                        }
                    }
                }
            }
            Some(TrackingDriver::Threaded { frames: sender, .. }) => {
                for frame in frames {
                    match sender.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(frame)) => {
                            SessionStats::incr(&self.shared.stats.frames_dropped);
                            debug!("[Session] tracking behind, frame {} dropped", frame.timestamp_ns);
                        }
                        Err(TrySendError::Disconnected(_)) => return Err(SlamError::SessionClosed),
                    }
                }
            }
            None => return Err(SlamError::SessionClosed),
        }
        Ok(results)
    }

    /// Latest tracking state; `Lost`/`Relocalizing` is the "currently
    /// lost" flag.
    pub fn tracking_state(&self) -> TrackingState {
        self.log.lock().last.as_ref().map_or(TrackingState::Uninitialized, |r| r.state)
    }

    pub fn last_result(&self) -> Option<TrackingResult> {
        self.log.lock().last.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    /// Flush pending frames, stop the workers and return the map.
    ///
    /// Fails with `NoKeyframes` when the session produced no keyframe.
    pub fn finish(self) -> Result<Atlas> {
        self.finish_with_report().map(|report| report.atlas)
    }

    /// Like [`finish`](Self::finish) but also returns session statistics.
    pub fn finish_with_report(mut self) -> Result<SessionReport> {
        let pending = self.reorder.drain();
        self.dispatch(pending)?;
        let lost_transitions = self.stop_workers();

        let loops = self.shared.loop_events();
        let stats = self.shared.stats.snapshot();
        let (trajectory, frames_tracked) = {
            let mut log = self.log.lock();
            (std::mem::take(&mut log.trajectory), log.frames_tracked)
        };
        let shared = self.shared.clone();
        drop(self);
        let atlas = match Arc::try_unwrap(shared) {
            Ok(state) => state.atlas.into_inner(),
            Err(shared) => shared.atlas.read().clone(),
        };
        if atlas.num_keyframes() == 0 {
            warn!("[Session] finished without keyframes");
            return Err(SlamError::NoKeyframes);
        }
        info!(
            "[Session] finished: {} frames, {} keyframes, {} landmarks, {} loops, {} optimizations applied",
            frames_tracked,
            atlas.num_keyframes(),
            atlas.map().num_map_points(),
            loops.len(),
            stats.optimizations_applied
        );
        Ok(SessionReport {
            atlas,
            stats,
            frames_tracked,
            lost_transitions,
            loops,
            trajectory,
        })
    }

    /// Join the workers in pipeline order. Dropping the tracker closes the
    /// keyframe channel; each stage then drains its queue and closes the next.
    fn stop_workers(&mut self) -> usize {
        let tracker = match self.driver.take() {
            Some(TrackingDriver::Inline(tracker)) => Some(*tracker),
            Some(TrackingDriver::Threaded { frames, handle }) => {
                drop(frames);
                handle.join().ok()
            }
            None => None,
        };
        let lost_transitions = tracker.as_ref().map_or(0, |t| t.lost_transitions());
        drop(tracker);

        for (name, handle) in [
            ("local mapping", self.local_mapping_handle.take()),
            ("loop closing", self.loop_closing_handle.take()),
            ("pose graph", self.optimizer_handle.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("[Session] {} thread panicked", name);
                }
            }
        }
        lost_transitions
    }
}

impl Drop for SlamSession {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.shared.request_shutdown();
            self.stop_workers();
        }
    }
}
