//! Pinhole camera model with Brown–Conrady distortion.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};

/// Iterations of the fixed-point undistortion solver.
const UNDISTORT_ITERATIONS: usize = 10;

/// Allowed range for rescaling intrinsics to a different image resolution.
const MIN_INTRINSICS_SCALE: f64 = 0.2;
const MAX_INTRINSICS_SCALE: f64 = 5.0;

/// Camera intrinsics, distortion and the resolution they were calibrated at.
///
/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Distortion coefficients [k1, k2, p1, p2, k3].
    #[serde(default)]
    pub distortion: [f64; 5],
    pub width: u32,
    pub height: u32,
}

impl CalibratedCamera {
    /// Undistorted pinhole camera.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 5],
            width,
            height,
        }
    }

    /// Reject intrinsics that cannot describe a real camera.
    pub fn validate(&self) -> Result<()> {
        let finite = [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .chain(self.distortion.iter())
            .all(|v| v.is_finite());
        if !finite {
            return Err(SlamError::Calibration("non-finite intrinsics".into()));
        }
        if self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(SlamError::Calibration(format!(
                "focal lengths must be positive (fx={}, fy={})",
                self.fx, self.fy
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(SlamError::Calibration("image resolution must be non-zero".into()));
        }
        Ok(())
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|&k| k != 0.0)
    }

    /// Intrinsics for the same lens at a different image resolution.
    ///
    /// Fails when the implied scale is outside [0.2, 5], which almost always
    /// means the image does not come from this camera.
    pub fn scaled_to(&self, width: u32, height: u32) -> Result<Self> {
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        let sx = width as f64 / self.width as f64;
        let sy = height as f64 / self.height as f64;
        for s in [sx, sy] {
            if !(MIN_INTRINSICS_SCALE..=MAX_INTRINSICS_SCALE).contains(&s) {
                return Err(SlamError::Calibration(format!(
                    "cannot rescale {}x{} intrinsics to {}x{}",
                    self.width, self.height, width, height
                )));
            }
        }
        Ok(Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            distortion: self.distortion,
            width,
            height,
        })
    }

    /// Project a camera-frame point to pixels (undistorted image).
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 1e-9 {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Back-project a pixel at a metric depth into the camera frame.
    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) / self.fx * depth,
            (v - self.cy) / self.fy * depth,
            depth,
        )
    }

    /// Normalized image coordinates (z = 1) of a pixel.
    pub fn normalized(&self, u: f64, v: f64) -> Vector2<f64> {
        Vector2::new((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    /// Unit bearing vector of a pixel in the camera frame.
    pub fn bearing(&self, u: f64, v: f64) -> Vector3<f64> {
        let n = self.normalized(u, v);
        Vector3::new(n.x, n.y, 1.0).normalize()
    }

    pub fn in_image(&self, uv: &Vector2<f64>, margin: f64) -> bool {
        uv.x >= -margin
            && uv.y >= -margin
            && uv.x < self.width as f64 + margin
            && uv.y < self.height as f64 + margin
    }

    /// Apply the distortion model to normalized coordinates.
    pub fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd, yd)
    }

    /// Pixel in the raw (distorted) image that maps to an undistorted pixel.
    pub fn distort_pixel(&self, u: f64, v: f64) -> (f64, f64) {
        let n = self.normalized(u, v);
        let (xd, yd) = self.distort_normalized(n.x, n.y);
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }

    /// Undistort a raw pixel by fixed-point iteration.
    pub fn undistort_pixel(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }
        let nd = self.normalized(u, v);
        let (mut x, mut y) = (nd.x, nd.y);
        let [k1, k2, p1, p2, k3] = self.distortion;
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (nd.x - dx) / radial;
            y = (nd.y - dy) / radial;
        }
        (x * self.fx + self.cx, y * self.fy + self.cy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> CalibratedCamera {
        CalibratedCamera::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    #[test]
    fn test_project_unproject_roundtrip() {
        let cam = test_camera();
        let p = cam.unproject(100.0, 50.0, 2.5);
        let uv = cam.project(&p).unwrap();
        assert_relative_eq!(uv, Vector2::new(100.0, 50.0), epsilon = 1e-9);
    }

    #[test]
    fn test_project_behind_camera() {
        assert!(test_camera().project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_scaled_to_half_resolution() {
        let cam = test_camera().scaled_to(320, 240).unwrap();
        assert_relative_eq!(cam.fx, 250.0);
        assert_relative_eq!(cam.cx, 160.0);
        assert_eq!(cam.width, 320);
    }

    #[test]
    fn test_scaled_to_rejects_extreme_ratio() {
        assert!(matches!(
            test_camera().scaled_to(6400, 4800),
            Err(SlamError::Calibration(_))
        ));
        assert!(test_camera().scaled_to(64, 48).is_err());
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let mut cam = test_camera();
        cam.distortion = [-0.2, 0.05, 0.001, -0.0005, 0.0];
        let (ud, vd) = cam.distort_pixel(400.0, 300.0);
        let (u, v) = cam.undistort_pixel(ud, vd);
        assert_relative_eq!(u, 400.0, epsilon = 1e-3);
        assert_relative_eq!(v, 300.0, epsilon = 1e-3);
    }

    #[test]
    fn test_validate() {
        assert!(test_camera().validate().is_ok());
        let mut bad = test_camera();
        bad.fx = 0.0;
        assert!(bad.validate().is_err());
        bad = test_camera();
        bad.width = 0;
        assert!(bad.validate().is_err());
    }
}
