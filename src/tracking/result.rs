//! Per-frame output of the tracker.

use serde::{Deserialize, Serialize};

use crate::atlas::map::KeyFrameId;
use crate::geometry::SE3;
use crate::tracking::keyframe_decision::KeyFrameVerdict;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub timestamp_ns: u64,
    pub state: TrackingState,
    /// Camera-to-world pose. The last good pose when the frame was lost.
    pub pose: SE3,
    pub reference_kf_id: Option<KeyFrameId>,
    pub metrics: TrackingMetrics,
    pub timing: TimingStats,
    /// Set when this frame was handed to mapping as a KeyFrame.
    pub keyframe: Option<KeyFrameVerdict>,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingMetrics {
    pub n_features: usize,
    pub n_depth_features: usize,
    pub n_map_point_matches: usize,
    pub n_inliers: usize,
    pub inlier_ratio: f64,
    pub delta_translation_m: f64,
    pub delta_rotation_deg: f64,
    /// The inertial rotation prior was used for prediction.
    pub used_imu_prior: bool,
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingStats {
    pub total_ms: f64,
    pub extract_orb_ms: f64,
    pub track_ms: f64,
    pub relocal_ms: f64,
}
