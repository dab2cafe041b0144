//! Pose-graph edges between keyframes.

use serde::{Deserialize, Serialize};

use crate::geometry::{Sim3, SE3};

use super::types::KeyFrameId;

/// Type of pose graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeType {
    /// Consecutive keyframes in creation order.
    Odometry,
    /// Verified revisit of an earlier place.
    LoopClosure,
}

/// A pose graph edge (constraint between two keyframes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseGraphEdge {
    pub kf_id_i: KeyFrameId,
    pub kf_id_j: KeyFrameId,

    /// Relative transform from i to j: T_wi⁻¹ ∘ T_wj.
    pub measurement: Sim3,

    /// Information weight (inverse covariance).
    pub information: f64,

    pub edge_type: EdgeType,
}

impl PoseGraphEdge {
    /// Edge whose measurement is the current relative pose of two keyframes.
    pub fn between(
        kf_id_i: KeyFrameId,
        pose_i: &SE3,
        kf_id_j: KeyFrameId,
        pose_j: &SE3,
        information: f64,
        edge_type: EdgeType,
    ) -> Self {
        Self {
            kf_id_i,
            kf_id_j,
            measurement: Sim3::from_se3(&pose_i.between(pose_j)),
            information,
            edge_type,
        }
    }

    pub fn connects(&self, kf: KeyFrameId) -> bool {
        self.kf_id_i == kf || self.kf_id_j == kf
    }

    /// Translation and rotation residual (metres, radians) of the edge for
    /// the given endpoint poses.
    pub fn residual(&self, pose_i: &SE3, pose_j: &SE3) -> (f64, f64) {
        let predicted = Sim3::from_se3(&pose_i.between(pose_j));
        let err = self.measurement.inverse().compose(&predicted);
        (err.translation.norm(), err.rotation.angle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_between_has_zero_residual() {
        let a = SE3::new(UnitQuaternion::from_euler_angles(0.1, 0.0, 0.2), Vector3::new(1.0, 2.0, 0.0));
        let b = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0), Vector3::new(-1.0, 0.5, 0.3));
        let edge = PoseGraphEdge::between(KeyFrameId(0), &a, KeyFrameId(5), &b, 1.0, EdgeType::LoopClosure);
        let (dt, dr) = edge.residual(&a, &b);
        assert!(dt < 1e-12 && dr < 1e-12);
        assert!(edge.connects(KeyFrameId(5)));
        assert!(!edge.connects(KeyFrameId(1)));
    }
}
