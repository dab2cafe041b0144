//! Tracking thread: processes raw Frames (+ IMU) and outputs KeyFrames.
//!
//! - Frame processing (preprocessing, ORB extraction, depth lookup)
//! - Gyro preintegration into a rotation prior
//! - Bootstrap from one depth frame or a monocular frame pair
//! - Track local map (projection-based search + RANSAC PnP)
//! - New KeyFrame decision
//! - Relocalization while lost

pub mod frame;
pub mod tracking_frame;
pub mod keyframe_decision;
pub mod matching;
pub mod motion_model;
pub mod state;
pub mod tracker;
pub mod result;

pub use result::TrackingResult;
pub use state::TrackingState;
pub use tracker::{Tracker, TrackingConfig};
