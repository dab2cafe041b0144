//! Velocity-based motion model for pose prediction.

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::SE3;

/// Constant velocity motion model.
///
/// Predicts the next pose based on the velocity observed between
/// the previous two frames. An inertial rotation prior, when available,
/// replaces the extrapolated rotation.
#[derive(Debug, Clone)]
pub struct MotionModel {
    /// Previous pose (T_wc).
    prev_pose: Option<SE3>,
    /// Velocity in world frame (translation per frame).
    velocity: Vector3<f64>,
    /// Rotation per frame, in the camera frame.
    angular_velocity: UnitQuaternion<f64>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self {
            prev_pose: None,
            velocity: Vector3::zeros(),
            angular_velocity: UnitQuaternion::identity(),
        }
    }

    /// Update the model with a new pose observation.
    pub fn update(&mut self, pose: &SE3) {
        if let Some(ref prev) = self.prev_pose {
            self.velocity = pose.translation - prev.translation;
            self.angular_velocity = prev.rotation.inverse() * pose.rotation;
        }
        self.prev_pose = Some(pose.clone());
    }

    /// Replace the last pose without changing the velocity (after the map
    /// was corrected under the tracker).
    pub fn rebase(&mut self, pose: &SE3) {
        self.prev_pose = Some(pose.clone());
    }

    /// Predict the next pose based on constant velocity assumption.
    pub fn predict(&self) -> Option<SE3> {
        self.prev_pose.as_ref().map(|prev| SE3 {
            rotation: prev.rotation * self.angular_velocity,
            translation: prev.translation + self.velocity,
        })
    }

    /// Predict with a measured rotation increment `R_prev_curr`.
    pub fn predict_with_rotation(&self, delta: &UnitQuaternion<f64>) -> Option<SE3> {
        self.prev_pose.as_ref().map(|prev| SE3 {
            rotation: prev.rotation * delta,
            translation: prev.translation + self.velocity,
        })
    }

    /// Forget the history after tracking was lost.
    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = Vector3::zeros();
        self.angular_velocity = UnitQuaternion::identity();
    }
}

impl Default for MotionModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant_velocity_prediction() {
        let mut model = MotionModel::new();
        assert!(model.predict().is_none());
        let r = UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0);
        model.update(&SE3::identity());
        model.update(&SE3::new(r, Vector3::new(0.1, 0.0, 0.0)));
        let p = model.predict().unwrap();
        assert_relative_eq!(p.translation, Vector3::new(0.2, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(p.rotation.angle(), 0.04, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_prior_overrides_extrapolation() {
        let mut model = MotionModel::new();
        model.update(&SE3::identity());
        model.update(&SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 0.0, 0.05)));
        let delta = UnitQuaternion::from_euler_angles(0.1, 0.0, 0.0);
        let p = model.predict_with_rotation(&delta).unwrap();
        assert_relative_eq!(p.rotation.angle(), 0.1, epsilon = 1e-12);
        assert_relative_eq!(p.translation.z, 0.1, epsilon = 1e-12);
    }
}
