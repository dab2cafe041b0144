//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Pose-graph nodes and edge measurements are Sim3 so that monocular maps
//! can absorb scale drift at a loop closure. Sessions with trusted depth
//! keep the scale fixed to 1.0, which makes every Sim3 an SE3.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::SE3;

/// Similarity transformation: p' = s * R * p + t.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from SE3 with scale = 1.0.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Drop the scale. Lossless when the scale is 1.0.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation,
        }
    }

    /// S⁻¹ = [(1/s)Rᵀ | -(1/s)Rᵀt].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// self ∘ other = [s1·s2·R1·R2 | s1·R1·t2 + t1].
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Check if this is essentially an SE3 transform (scale ≈ 1.0).
    pub fn is_se3(&self, tolerance: f64) -> bool {
        (self.scale - 1.0).abs() < tolerance
    }

    /// Tangent coordinates [rotation_vec (3), translation (3), log_scale (1)].
    pub fn log(&self) -> [f64; 7] {
        let rot_vec = self.rotation.scaled_axis();
        [
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    /// Inverse of [`Sim3::log`].
    pub fn exp(tangent: &[f64; 7]) -> Self {
        let rot_vec = Vector3::new(tangent[0], tangent[1], tangent[2]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rot_vec),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}
