//! Global pose-graph optimization thread.
//!
//! Requests arrive from Loop Closing with a ticket. Only the latest
//! ticket's result is ever applied: a request that is already superseded
//! is skipped, a solve that gets superseded stops early and its result is
//! discarded. Results are applied in one write-lock section through
//! `Map::apply_pose_batch`.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::optimizer::pose_graph::{self, PoseGraphConfig};
use crate::system::messages::OptimizationRequest;
use crate::system::shared_state::{SessionStats, SharedState};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Snapshot/apply retries when a local correction lands mid-solve.
const MAX_ATTEMPTS: usize = 3;

/// Outcome of one optimization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationOutcome {
    /// Poses were corrected.
    Applied { keyframes: usize },
    /// The graph was already consistent.
    NothingToDo,
    /// A newer request superseded this one.
    Stale,
}

pub struct GlobalOptimizer {
    shared: Arc<SharedState>,
    config: PoseGraphConfig,
}

impl GlobalOptimizer {
    pub fn new(shared: Arc<SharedState>, config: PoseGraphConfig) -> Self {
        Self { shared, config }
    }

    pub fn run(&mut self, receiver: Receiver<OptimizationRequest>) {
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }
            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(mut request) => {
                    // Only the newest queued request matters.
                    while let Ok(newer) = receiver.try_recv() {
                        self.discard(request.ticket);
                        request = newer;
                    }
                    self.optimize(request);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("[GlobalPoseGraph] exiting");
    }

    /// Run one global optimization for `request`.
    pub fn optimize(&self, request: OptimizationRequest) -> OptimizationOutcome {
        let ticket = request.ticket;
        for attempt in 0..MAX_ATTEMPTS {
            if !self.shared.is_latest(ticket) {
                self.discard(ticket);
                return OptimizationOutcome::Stale;
            }

            // PHASE 1: COLLECT (read lock)
            let problem = {
                let atlas = self.shared.atlas.read();
                pose_graph::collect_global(atlas.map(), &self.config)
            };
            let Some(problem) = problem else {
                self.shared.finish_ticket(ticket);
                return OptimizationOutcome::NothingToDo;
            };

            // PHASE 2: SOLVE (no lock held)
            let should_stop = || !self.shared.is_latest(ticket);
            let result = pose_graph::solve(&problem, &self.config, &should_stop);
            if !self.shared.is_latest(ticket) {
                self.discard(ticket);
                return OptimizationOutcome::Stale;
            }
            let Some(result) = result else {
                self.shared.finish_ticket(ticket);
                return OptimizationOutcome::NothingToDo;
            };

            // PHASE 3: APPLY (write lock, one batch)
            let mut atlas = self.shared.atlas.write();
            if !self.shared.is_latest(ticket) {
                drop(atlas);
                self.discard(ticket);
                return OptimizationOutcome::Stale;
            }
            match pose_graph::apply(atlas.map_mut(), &result) {
                Some(n) => {
                    drop(atlas);
                    SessionStats::incr(&self.shared.stats.optimizations_applied);
                    self.shared.finish_ticket(ticket);
                    info!(
                        "[GlobalPoseGraph] ticket {} (loop at {}): {} poses corrected, error {:.3e} -> {:.3e} in {} iterations",
                        ticket, request.trigger, n, result.initial_error, result.final_error, result.iterations
                    );
                    return OptimizationOutcome::Applied { keyframes: n };
                }
                None => {
                    debug!(
                        "[GlobalPoseGraph] ticket {}: map changed during solve (attempt {})",
                        ticket,
                        attempt + 1
                    );
                }
            }
        }
        warn!("[GlobalPoseGraph] ticket {}: gave up after {} attempts", ticket, MAX_ATTEMPTS);
        self.discard(ticket);
        OptimizationOutcome::Stale
    }

    fn discard(&self, ticket: u64) {
        SessionStats::incr(&self.shared.stats.optimizations_discarded);
        warn!("[GlobalPoseGraph] stale optimization (ticket {}) discarded", ticket);
        self.shared.finish_ticket(ticket);
    }
}
