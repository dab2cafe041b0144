//! Tracking state machine.
//!
//! ```text
//! Uninitialized ──bootstrap──▶ Tracking ──too few inliers──▶ Lost
//!                                  ▲                          │
//!                                  └──── relocalized ◀── Relocalizing
//! ```

use serde::{Deserialize, Serialize};

/// State of the tracking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackingState {
    /// No map yet: waiting for a frame (RGB-D) or frame pair (monocular)
    /// to bootstrap from.
    #[default]
    Uninitialized,
    /// Pose estimated against the local map.
    Tracking,
    /// Tracking failed on this frame.
    Lost,
    /// Relocalization against the whole map was attempted and failed.
    Relocalizing,
}

impl TrackingState {
    /// Whether the frame produced a usable pose.
    pub fn has_pose(&self) -> bool {
        matches!(self, TrackingState::Tracking)
    }

    /// Whether the tracker is trying to recover.
    pub fn is_lost(&self) -> bool {
        matches!(self, TrackingState::Lost | TrackingState::Relocalizing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_uninitialized() {
        assert_eq!(TrackingState::default(), TrackingState::Uninitialized);
        assert!(!TrackingState::Uninitialized.has_pose());
        assert!(TrackingState::Relocalizing.is_lost());
        assert!(!TrackingState::Tracking.is_lost());
    }
}
