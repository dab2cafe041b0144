//! Synthetic RGB-D scenes for the end-to-end tests.
//!
//! The scene is the inside of an axis-aligned box whose walls carry a
//! random-colour checker texture. Every pixel is ray cast exactly, so the
//! depth channel is ground truth (quantised to millimetres).

#![allow(dead_code)]

use image::{Luma, Rgb, RgbImage};
use nalgebra::{UnitQuaternion, Vector3};

use vislam::config::ProcessingMode;
use vislam::geometry::SE3;
use vislam::imu::ImuSample;
use vislam::tracking::frame::DepthImage;
use vislam::{CalibratedCamera, Frame, SlamConfig};

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;
pub const FRAME_PERIOD_NS: u64 = 33_333_333;
pub const IMU_PERIOD_NS: u64 = 5_000_000;

/// Fine texture cell edge, metres.
const CELL_M: f64 = 0.08;
/// Coarse texture cell edge, metres.
const BLOCK_M: f64 = 0.32;

pub fn camera() -> CalibratedCamera {
    CalibratedCamera::pinhole(260.0, 260.0, 160.0, 120.0, WIDTH, HEIGHT)
}

/// Config for deterministic synthetic runs.
pub fn test_config() -> SlamConfig {
    let mut config = SlamConfig::default();
    config.system.mode = ProcessingMode::Offline;
    config.system.reorder_window_ns = 0;
    config.mapping.time_budget_ms = 60_000;
    config
}

pub fn timestamp(k: usize) -> u64 {
    1_000_000_000 + k as u64 * FRAME_PERIOD_NS
}

pub fn frame_index(timestamp_ns: u64) -> usize {
    ((timestamp_ns - 1_000_000_000 + FRAME_PERIOD_NS / 2) / FRAME_PERIOD_NS) as usize
}

/// Camera-to-world pose with a yaw about the camera's y axis.
pub fn pose(yaw: f64, position: Vector3<f64>) -> SE3 {
    SE3::new(UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw), position)
}

#[derive(Debug, Clone, Copy)]
pub struct Room {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Room {
    pub fn new(min: Vector3<f64>, max: Vector3<f64>) -> Self {
        Self { min, max }
    }

    /// Nearest wall hit along `dir` from `origin` (inside the box):
    /// distance parameter, wall index and hit point.
    fn cast(&self, origin: &Vector3<f64>, dir: &Vector3<f64>) -> Option<(f64, usize, Vector3<f64>)> {
        let mut best: Option<(f64, usize)> = None;
        for axis in 0..3 {
            if dir[axis].abs() < 1e-12 {
                continue;
            }
            for (side, bound) in [self.min[axis], self.max[axis]].into_iter().enumerate() {
                let t = (bound - origin[axis]) / dir[axis];
                if t > 0.0 && best.map_or(true, |(bt, _)| t < bt) {
                    best = Some((t, axis * 2 + side));
                }
            }
        }
        best.map(|(t, wall)| (t, wall, origin + dir * t))
    }

    fn albedo(&self, wall: usize, p: &Vector3<f64>) -> [f64; 3] {
        let axis = wall / 2;
        let (a, b) = match axis {
            0 => (p.y, p.z),
            1 => (p.x, p.z),
            _ => (p.x, p.y),
        };
        let fine = hash(wall as u64, (a / CELL_M).floor() as i64, (b / CELL_M).floor() as i64);
        let coarse = hash(wall as u64 + 16, (a / BLOCK_M).floor() as i64, (b / BLOCK_M).floor() as i64);
        let mut rgb = [0.0; 3];
        for (c, out) in rgb.iter_mut().enumerate() {
            let f = ((fine >> (8 * c)) & 0xff) as f64;
            let g = ((coarse >> (8 * c + 24)) & 0xff) as f64;
            *out = 0.65 * f + 0.35 * g;
        }
        rgb
    }

    /// Colour image and millimetre depth seen from `pose` (camera-to-world).
    pub fn render(&self, cam: &CalibratedCamera, pose: &SE3) -> (RgbImage, DepthImage) {
        let rot = pose.rotation_matrix();
        let origin = pose.translation;
        let mut color = RgbImage::new(cam.width, cam.height);
        let mut depth = DepthImage::new(cam.width, cam.height);

        for v in 0..cam.height {
            for u in 0..cam.width {
                let mut acc = [0.0; 3];
                for (du, dv) in [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)] {
                    let d_cam = Vector3::new(
                        (u as f64 + du - 0.5 - cam.cx) / cam.fx,
                        (v as f64 + dv - 0.5 - cam.cy) / cam.fy,
                        1.0,
                    );
                    if let Some((_, wall, hit)) = self.cast(&origin, &(rot * d_cam)) {
                        let c = self.albedo(wall, &hit);
                        for k in 0..3 {
                            acc[k] += 0.25 * c[k];
                        }
                    }
                }
                color.put_pixel(u, v, Rgb([acc[0] as u8, acc[1] as u8, acc[2] as u8]));

                // The camera-frame ray has unit z, so the hit parameter is the depth.
                let d_cam = Vector3::new((u as f64 - cam.cx) / cam.fx, (v as f64 - cam.cy) / cam.fy, 1.0);
                if let Some((t, _, _)) = self.cast(&origin, &(rot * d_cam)) {
                    let mm = (t * 1000.0).round().min(u16::MAX as f64);
                    depth.put_pixel(u, v, Luma([mm as u16]));
                }
            }
        }
        (color, depth)
    }

    pub fn rgbd_frame(&self, cam: &CalibratedCamera, k: usize, pose: &SE3) -> Frame {
        let (color, depth) = self.render(cam, pose);
        Frame::new(timestamp(k), color).with_depth(depth)
    }

    pub fn mono_frame(&self, cam: &CalibratedCamera, k: usize, pose: &SE3) -> Frame {
        let (color, _) = self.render(cam, pose);
        Frame::new(timestamp(k), color)
    }
}

/// Gyro samples in `(timestamp(k-1), timestamp(k)]` for a constant yaw rate.
pub fn yaw_gyro(k: usize, yaw_rate: f64) -> Vec<ImuSample> {
    let start = timestamp(k.saturating_sub(1));
    let end = timestamp(k);
    let mut out = Vec::new();
    let mut t = start + IMU_PERIOD_NS;
    while t <= end {
        out.push(ImuSample::new(t, Vector3::new(0.0, yaw_rate, 0.0), Vector3::new(0.0, -9.81, 0.0)));
        t += IMU_PERIOD_NS;
    }
    if out.last().map_or(true, |s| s.timestamp_ns != end) {
        out.push(ImuSample::new(end, Vector3::new(0.0, yaw_rate, 0.0), Vector3::new(0.0, -9.81, 0.0)));
    }
    out
}

/// Zero out depth readings in the columns `[0, cols)`.
pub fn blank_depth_columns(depth: &mut DepthImage, cols: u32) {
    let height = depth.height();
    for v in 0..height {
        for u in 0..cols.min(depth.width()) {
            depth.put_pixel(u, v, Luma([0]));
        }
    }
}

/// Multiply every depth reading by `factor`, as a miscalibrated sensor would.
pub fn scale_depth(depth: &mut DepthImage, factor: f64) {
    for px in depth.pixels_mut() {
        px[0] = (px[0] as f64 * factor).round().min(u16::MAX as f64) as u16;
    }
}

fn hash(seed: u64, i: i64, j: i64) -> u64 {
    // splitmix64 over the packed cell coordinates
    let mut z = seed
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((i as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9))
        .wrapping_add((j as u64).wrapping_mul(0x94D0_49BB_1331_11EB));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
