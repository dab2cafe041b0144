//! Pose-graph optimization over odometry and loop-closure edges.
//!
//! Used incrementally by Local Mapping (a window of recent keyframes) and
//! globally by the loop-closure optimizer thread.

pub mod pose_graph;

pub use pose_graph::{PoseGraphConfig, PoseGraphProblem, PoseGraphResult};
