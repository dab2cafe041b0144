//! Loop Closing.
//!
//! This module implements loop detection, geometric verification, and
//! asynchronous pose-graph correction to eliminate accumulated drift.
//!
//! # Architecture
//!
//! 1. **Detection** (`detector.rs`): vocabulary candidates, verified with
//!    RANSAC PnP against the candidate's landmarks
//! 2. **Thread** (`loop_closer.rs`): receives keyframes, adds loop edges
//! 3. **Correction** (`global_optimizer.rs`): ticketed global pose graph
//!
//! # Threading Model
//!
//! Both threads use the three-phase locking pattern:
//! - Phase 1 (COLLECT): Read lock to gather data
//! - Phase 2 (SOLVE): No lock, pure computation
//! - Phase 3 (APPLY): Write lock to update the map

pub mod detector;
pub mod global_optimizer;
pub mod loop_closer;

pub use detector::{
    collect_loop_query, match_and_verify, verify_loop_query, LandmarkSet, LoopCandidate, LoopClosingConfig,
    LoopClosure, LoopQuery,
};
pub use global_optimizer::{GlobalOptimizer, OptimizationOutcome};
pub use loop_closer::{LoopCloser, LoopCloserStats};
