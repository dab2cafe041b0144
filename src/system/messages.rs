//! Inter-thread message types.
//!
//! These types are sent between threads via channels to coordinate
//! SLAM processing.

use crate::atlas::map::{KeyFrameId, MapPointId, NewKeyFrame};

/// Message sent from Tracking to Local Mapping when a new keyframe is created.
///
/// Contains all the data needed for Local Mapping to:
/// 1. Insert the keyframe into the map
/// 2. Associate existing map point matches
/// 3. Create new landmarks from depth and from neighbour keyframes
#[derive(Debug, Clone)]
pub struct NewKeyFrameMsg {
    /// Pose, features, depth and colour of the keyframe.
    pub keyframe: NewKeyFrame,

    /// Map point associations from tracking.
    /// `matched_map_points[i] = Some(mp_id)` if feature i was matched
    /// to an existing map point during tracking.
    pub matched_map_points: Vec<Option<MapPointId>>,

    /// Landmarks predicted to be visible in the frame, matched or not.
    pub visible_map_points: Vec<MapPointId>,
}

/// Keyframe forwarded from Local Mapping to Loop Closing.
#[derive(Debug, Clone, Copy)]
pub struct LoopQueryMsg {
    pub kf_id: KeyFrameId,
}

/// Global pose-graph optimization scheduled by Loop Closing.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationRequest {
    /// Only the result of the latest ticket is applied.
    pub ticket: u64,
    /// Keyframe whose loop closure triggered the request.
    pub trigger: KeyFrameId,
}
