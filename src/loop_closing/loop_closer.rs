//! LoopCloser - Main loop closing thread.
//!
//! This module implements the main loop closing thread that:
//! 1. Receives keyframes from LocalMapping
//! 2. Detects loop candidates using the vocabulary
//! 3. Verifies candidates with RANSAC PnP against their landmarks
//! 4. Adds the best verified loop edge to the map
//! 5. Schedules a global pose-graph optimization on the optimizer thread

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::atlas::map::{EdgeType, KeyFrameId, PoseGraphEdge};
use crate::config::SlamConfig;
use crate::error::SlamError;
use crate::system::messages::{LoopQueryMsg, OptimizationRequest};
use crate::system::SharedState;
use crate::tracking::frame::CalibratedCamera;
use crate::tracking::matching::DescriptorMatcher;

use super::detector::{collect_loop_query, verify_loop_query, LoopClosure};

/// Timeout for receiving keyframes from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Statistics for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    /// Number of keyframes processed.
    pub keyframes_processed: usize,

    /// Number of keyframes that had at least one BoW candidate.
    pub candidates_detected: usize,

    /// Number of loops accepted.
    pub loops_accepted: usize,
}

/// The LoopCloser thread handler.
pub struct LoopCloser {
    /// Shared state with other threads.
    shared: Arc<SharedState>,

    camera: CalibratedCamera,
    config: Arc<SlamConfig>,
    matcher: DescriptorMatcher,

    /// Global optimization requests.
    opt_sender: Option<Sender<OptimizationRequest>>,

    stats: LoopCloserStats,
}

impl LoopCloser {
    /// Create a new LoopCloser.
    pub fn new(
        shared: Arc<SharedState>,
        camera: CalibratedCamera,
        config: Arc<SlamConfig>,
        opt_sender: Option<Sender<OptimizationRequest>>,
    ) -> Self {
        let matcher = DescriptorMatcher::new(config.matcher.clone());
        Self {
            shared,
            camera,
            config,
            matcher,
            opt_sender,
            stats: LoopCloserStats::default(),
        }
    }

    /// Run the main loop closing thread.
    ///
    /// This function blocks and processes keyframes until the channel is closed
    /// or shutdown is requested.
    pub fn run(&mut self, kf_receiver: Receiver<LoopQueryMsg>) {
        debug!("[LoopClosing] thread started");

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }
            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    self.process_keyframe(msg.kf_id);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(
            "[LoopClosing] exiting: processed={}, with candidates={}, accepted={}",
            self.stats.keyframes_processed, self.stats.candidates_detected, self.stats.loops_accepted
        );
    }

    /// Process a single keyframe for loop detection. Returns the accepted
    /// loop, if any.
    pub fn process_keyframe(&mut self, kf_id: KeyFrameId) -> Option<LoopClosure> {
        self.stats.keyframes_processed += 1;
        let config = &self.config.loop_closing;

        // Step 1: Collect candidates (read lock)
        let query = {
            let atlas = self.shared.atlas.read();
            collect_loop_query(&atlas, kf_id, config)
        }?;
        self.stats.candidates_detected += 1;

        // Step 2: Verify without holding the lock
        let closure = match verify_loop_query(&query, &self.matcher, &self.camera, config) {
            Ok(c) => c,
            Err(SlamError::NoLoopClosure) => {
                debug!(
                    "[LoopClosing] {}: none of {} candidates verified",
                    kf_id,
                    query.candidates.len()
                );
                return None;
            }
            Err(e) => {
                warn!("[LoopClosing] {}: verification failed: {}", kf_id, e);
                return None;
            }
        };

        // Step 3: Add the edge (write lock)
        {
            let mut atlas = self.shared.atlas.write();
            let edge = PoseGraphEdge {
                kf_id_i: closure.loop_kf,
                kf_id_j: closure.query_kf,
                measurement: closure.measurement.clone(),
                information: self.config.pose_graph.loop_information,
                edge_type: EdgeType::LoopClosure,
            };
            if !atlas.map_mut().add_loop_edge(edge) {
                debug!("[LoopClosing] {}: endpoint removed before the edge was added", kf_id);
                return None;
            }
        }
        self.stats.loops_accepted += 1;
        self.shared.record_loop(closure.clone());
        info!(
            "[LoopClosing] loop accepted: {} -> {} (score {:.3}, {}/{} inliers, drift {:.3} m / {:.2} deg)",
            closure.query_kf,
            closure.loop_kf,
            closure.bow_score,
            closure.num_inliers,
            closure.num_matches,
            closure.residual_before.0,
            closure.residual_before.1.to_degrees()
        );

        // Step 4: Schedule a global optimization; older ones become stale
        let ticket = self.shared.next_ticket();
        match self.opt_sender {
            Some(ref sender) => {
                if sender.send(OptimizationRequest { ticket, trigger: kf_id }).is_err() {
                    warn!("[LoopClosing] optimizer thread is gone");
                    self.shared.finish_ticket(ticket);
                }
            }
            None => self.shared.finish_ticket(ticket),
        }
        Some(closure)
    }

    /// Get current statistics.
    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::Atlas;
    use crate::vocabulary::VocabularyConfig;

    #[test]
    fn test_keyframe_without_candidates_is_ignored() {
        let camera = CalibratedCamera::pinhole(100.0, 100.0, 50.0, 50.0, 100, 100);
        let shared = SharedState::new(Atlas::new(camera.clone(), 32, VocabularyConfig::default()).unwrap());
        let mut closer = LoopCloser::new(shared.clone(), camera, Arc::new(SlamConfig::default()), None);
        assert!(closer.process_keyframe(KeyFrameId(3)).is_none());
        assert_eq!(closer.stats().keyframes_processed, 1);
        assert_eq!(closer.stats().candidates_detected, 0);
        assert!(shared.loop_events().is_empty());
    }
}
