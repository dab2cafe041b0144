//! KeyFrame decision criteria.
//!
//! A tracked frame becomes a KeyFrame when it moved far enough from the
//! last KeyFrame (translation or rotation gate) or when tracking quality is
//! dropping. The rotation gate only applies once a KeyFrame has been
//! promoted after the bootstrap: rotating in place over the bootstrap map
//! adds no baseline. Frames with too little texture or too few inliers are
//! rejected even if a gate fires.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};
use crate::geometry::SE3;

/// KeyFrame selection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyFrameConfig {
    /// Translation since the last KeyFrame that triggers a new one, metres.
    /// Default: 0.02
    pub min_translation_m: f64,

    /// Rotation since the last KeyFrame that triggers a new one, radians.
    /// Not applied to the first KeyFrame after the bootstrap.
    /// Default: 0.03
    pub min_rotation_rad: f64,

    /// A new KeyFrame is inserted when the tracked landmark count falls
    /// below this fraction of the reference KeyFrame's count.
    /// Default: 0.6
    pub min_tracked_ratio: f64,

    /// Frames with fewer extracted features are never promoted.
    /// Default: 100
    pub min_features: usize,

    /// Frames with fewer pose inliers are never promoted.
    /// Default: 20
    pub min_inliers: usize,
}

impl Default for KeyFrameConfig {
    fn default() -> Self {
        Self {
            min_translation_m: 0.02,
            min_rotation_rad: 0.03,
            min_tracked_ratio: 0.6,
            min_features: 100,
            min_inliers: 20,
        }
    }
}

impl KeyFrameConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_translation_m >= 0.0 && self.min_rotation_rad >= 0.0) {
            return Err(SlamError::Config("keyframe gates must be non-negative".into()));
        }
        if !(0.0..=1.0).contains(&self.min_tracked_ratio) {
            return Err(SlamError::Config("keyframe.min_tracked_ratio must be in [0, 1]".into()));
        }
        Ok(())
    }
}

/// Why a KeyFrame was (not) created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameVerdict {
    /// Moved past the translation gate.
    Translation,
    /// Rotated past the angular gate.
    Rotation,
    /// Tracked landmark count dropped.
    TrackingWeak,
    /// No gate fired.
    NotNeeded,
    /// A gate fired but the frame is too poor to anchor map structure.
    LowTexture,
}

impl KeyFrameVerdict {
    pub fn accepted(&self) -> bool {
        matches!(
            self,
            KeyFrameVerdict::Translation | KeyFrameVerdict::Rotation | KeyFrameVerdict::TrackingWeak
        )
    }
}

/// Per-frame tracking figures the decision looks at.
#[derive(Debug, Clone, Copy)]
pub struct FrameQuality {
    pub num_features: usize,
    pub num_inliers: usize,
}

/// KeyFrame selection policy.
#[derive(Debug, Clone)]
pub struct KeyFrameDecision {
    config: KeyFrameConfig,
    /// Inliers of the frame the reference KeyFrame was created from.
    reference_tracked: usize,
    /// KeyFrames promoted since the map was bootstrapped.
    promoted: usize,
}

impl KeyFrameDecision {
    pub fn new(config: KeyFrameConfig) -> Self {
        Self {
            config,
            reference_tracked: 0,
            promoted: 0,
        }
    }

    /// Decide whether the frame at `pose` should become a KeyFrame.
    pub fn decide(&self, pose: &SE3, last_keyframe_pose: &SE3, quality: FrameQuality) -> KeyFrameVerdict {
        let verdict = if pose.distance_to(last_keyframe_pose) > self.config.min_translation_m {
            KeyFrameVerdict::Translation
        } else if self.promoted > 0 && pose.angle_to(last_keyframe_pose) > self.config.min_rotation_rad {
            KeyFrameVerdict::Rotation
        } else if self.reference_tracked > 0
            && (quality.num_inliers as f64) < self.config.min_tracked_ratio * self.reference_tracked as f64
        {
            KeyFrameVerdict::TrackingWeak
        } else {
            return KeyFrameVerdict::NotNeeded;
        };

        if quality.num_features < self.config.min_features || quality.num_inliers < self.config.min_inliers {
            return KeyFrameVerdict::LowTexture;
        }
        verdict
    }

    /// Start over on a freshly bootstrapped map.
    pub fn start(&mut self, tracked: usize) {
        self.reference_tracked = tracked;
        self.promoted = 0;
    }

    /// Reset after KeyFrame creation.
    pub fn reset(&mut self, tracked: usize) {
        self.reference_tracked = tracked;
        self.promoted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn good() -> FrameQuality {
        FrameQuality {
            num_features: 800,
            num_inliers: 200,
        }
    }

    #[test]
    fn test_translation_gate() {
        let mut d = KeyFrameDecision::new(KeyFrameConfig::default());
        d.reset(200);
        let kf = SE3::identity();
        let near = SE3::new(UnitQuaternion::identity(), Vector3::new(0.01, 0.0, 0.0));
        let far = SE3::new(UnitQuaternion::identity(), Vector3::new(0.03, 0.0, 0.0));
        assert_eq!(d.decide(&near, &kf, good()), KeyFrameVerdict::NotNeeded);
        assert_eq!(d.decide(&far, &kf, good()), KeyFrameVerdict::Translation);
    }

    #[test]
    fn test_rotation_gate() {
        let mut d = KeyFrameDecision::new(KeyFrameConfig::default());
        d.reset(200);
        let turned = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0), Vector3::zeros());
        assert_eq!(d.decide(&turned, &SE3::identity(), good()), KeyFrameVerdict::Rotation);
    }

    #[test]
    fn test_rotation_gate_waits_for_first_keyframe() {
        let mut d = KeyFrameDecision::new(KeyFrameConfig::default());
        d.start(200);
        let turned = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0), Vector3::zeros());
        assert_eq!(d.decide(&turned, &SE3::identity(), good()), KeyFrameVerdict::NotNeeded);

        // Translation still promotes the first keyframe; rotation counts after it.
        let moved = SE3::new(UnitQuaternion::identity(), Vector3::new(0.03, 0.0, 0.0));
        assert_eq!(d.decide(&moved, &SE3::identity(), good()), KeyFrameVerdict::Translation);
        d.reset(200);
        assert_eq!(d.decide(&turned, &SE3::identity(), good()), KeyFrameVerdict::Rotation);

        // A new bootstrap re-arms the exemption.
        d.start(200);
        assert_eq!(d.decide(&turned, &SE3::identity(), good()), KeyFrameVerdict::NotNeeded);
    }

    #[test]
    fn test_weak_tracking_gate() {
        let mut d = KeyFrameDecision::new(KeyFrameConfig::default());
        d.reset(400);
        let q = FrameQuality {
            num_features: 800,
            num_inliers: 150,
        };
        assert_eq!(d.decide(&SE3::identity(), &SE3::identity(), q), KeyFrameVerdict::TrackingWeak);
    }

    #[test]
    fn test_low_texture_rejected_even_when_gate_fires() {
        let d = KeyFrameDecision::new(KeyFrameConfig::default());
        let far = SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));
        let poor = FrameQuality {
            num_features: 40,
            num_inliers: 15,
        };
        let verdict = d.decide(&far, &SE3::identity(), poor);
        assert_eq!(verdict, KeyFrameVerdict::LowTexture);
        assert!(!verdict.accepted());
    }
}
