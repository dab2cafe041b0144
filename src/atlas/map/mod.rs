//! Map module - Core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature observations
//! - [`MapPoint`] - 3D landmarks observed by KeyFrames
//! - [`PoseGraphEdge`] - Odometry and loop-closure constraints
//! - [`Map`] - Container managing KeyFrames, MapPoints, and their relationships
//!
//! # Architecture
//!
//! The map forms a bipartite graph structure:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames also take part in two graph structures:
//! - **Covisibility Graph**: Edges weighted by shared MapPoint count
//! - **Pose Graph**: Odometry chain in creation order plus loop closures

pub mod edge;
pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use edge::{EdgeType, PoseGraphEdge};
pub use keyframe::{DenseSample, KeyFrame};
pub use map::{Map, NewKeyFrame, ODOMETRY_INFORMATION};
pub use map_point::{LandmarkOrigin, MapPoint, Observation};
pub use types::{KeyFrameId, MapPointId};
