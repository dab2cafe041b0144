//! Frame-level processing: camera model, preprocessing, ORB extraction.

pub mod camera;
pub mod orb;
pub mod preprocess;

use image::{ImageBuffer, Luma, RgbImage};

use crate::error::{Result, SlamError};
use crate::imu::ImuSample;

pub use camera::CalibratedCamera;
pub use orb::{Descriptors, ExtractorConfig, FeatureSet, KeyPoint, OrbExtractor};
pub use preprocess::{preprocess, ImagePyramid};

/// 16-bit depth image in millimetres. Zero marks an invalid reading.
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// One capture as delivered by the ingestion boundary.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture-device clock, nanoseconds.
    pub timestamp_ns: u64,
    pub color: RgbImage,
    /// Aligned to the colour grid, or at a known integer ratio of it.
    pub depth: Option<DepthImage>,
    /// Inertial samples since the previous frame.
    pub imu: Vec<ImuSample>,
}

impl Frame {
    pub fn new(timestamp_ns: u64, color: RgbImage) -> Self {
        Self {
            timestamp_ns,
            color,
            depth: None,
            imu: Vec::new(),
        }
    }

    pub fn with_depth(mut self, depth: DepthImage) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_imu(mut self, imu: Vec<ImuSample>) -> Self {
        self.imu = imu;
        self
    }

    /// Structural checks that must pass before a frame touches the map.
    pub fn validate(&self) -> Result<()> {
        let (w, h) = self.color.dimensions();
        if w == 0 || h == 0 {
            return Err(SlamError::InvalidFrame("empty colour image".into()));
        }
        if let Some(depth) = &self.depth {
            let (dw, dh) = depth.dimensions();
            if dw == 0 || dh == 0 {
                return Err(SlamError::InvalidFrame("empty depth image".into()));
            }
            // Depth must cover the colour grid at an integer ratio.
            if w % dw != 0 || h % dh != 0 || w / dw != h / dh {
                return Err(SlamError::InvalidFrame(format!(
                    "depth {}x{} is not aligned with colour {}x{}",
                    dw, dh, w, h
                )));
            }
        }
        if self
            .imu
            .iter()
            .any(|s| !s.gyro.iter().chain(s.accel.iter()).all(|v| v.is_finite()))
        {
            return Err(SlamError::InvalidFrame("non-finite inertial sample".into()));
        }
        Ok(())
    }

    /// Depth in metres at a colour pixel, `None` for missing or invalid readings.
    pub fn depth_at(&self, u: f64, v: f64) -> Option<f64> {
        let depth = self.depth.as_ref()?;
        depth_lookup(depth, self.color.width(), u, v)
    }
}

/// Depth in metres at a colour pixel of an image `color_width` wide.
///
/// Interpolates bilinearly between the four surrounding readings when they
/// agree within [`DEPTH_EDGE_RATIO`], otherwise (missing readings or a depth
/// edge) takes the nearest pixel. Zero readings are reported as `None`.
pub fn depth_lookup(depth: &DepthImage, color_width: u32, u: f64, v: f64) -> Option<f64> {
    let ratio = (color_width / depth.width().max(1)).max(1) as f64;
    let (du, dv) = (u / ratio, v / ratio);
    let (w, h) = depth.dimensions();
    if du < -0.5 || dv < -0.5 || du >= w as f64 - 0.5 || dv >= h as f64 - 0.5 {
        return None;
    }
    bilinear_depth(depth, du, dv).or_else(|| {
        let raw = depth.get_pixel(du.round() as u32, dv.round() as u32)[0];
        (raw != 0).then(|| raw as f64 / 1000.0)
    })
}

/// Neighbouring readings further apart than this fraction are a depth edge.
const DEPTH_EDGE_RATIO: f64 = 0.02;

fn bilinear_depth(depth: &DepthImage, du: f64, dv: f64) -> Option<f64> {
    let (w, h) = depth.dimensions();
    if du < 0.0 || dv < 0.0 {
        return None;
    }
    let (x0, y0) = (du.floor() as u32, dv.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (du - x0 as f64, dv - y0 as f64);
    let corners = [
        (depth.get_pixel(x0, y0)[0], (1.0 - fx) * (1.0 - fy)),
        (depth.get_pixel(x1, y0)[0], fx * (1.0 - fy)),
        (depth.get_pixel(x0, y1)[0], (1.0 - fx) * fy),
        (depth.get_pixel(x1, y1)[0], fx * fy),
    ];
    let lo = corners.iter().map(|c| c.0).min()?;
    let hi = corners.iter().map(|c| c.0).max()?;
    if lo == 0 || (hi - lo) as f64 > DEPTH_EDGE_RATIO * lo as f64 {
        return None;
    }
    let mm: f64 = corners.iter().map(|&(raw, wgt)| raw as f64 * wgt).sum();
    Some(mm / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_validate_rejects_misaligned_depth() {
        let frame = Frame::new(0, RgbImage::new(64, 48)).with_depth(DepthImage::new(30, 20));
        assert!(matches!(frame.validate(), Err(SlamError::InvalidFrame(_))));

        let half = Frame::new(0, RgbImage::new(64, 48)).with_depth(DepthImage::new(32, 24));
        assert!(half.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nan_imu() {
        let sample = ImuSample {
            timestamp_ns: 0,
            gyro: Vector3::new(f64::NAN, 0.0, 0.0),
            accel: Vector3::zeros(),
        };
        let frame = Frame::new(0, RgbImage::new(8, 8)).with_imu(vec![sample]);
        assert!(frame.validate().is_err());
    }

    #[test]
    fn test_depth_lookup_zero_is_invalid() {
        let mut depth = DepthImage::from_pixel(4, 4, Luma([1500]));
        depth.put_pixel(1, 1, Luma([0]));
        assert_eq!(depth_lookup(&depth, 8, 0.0, 0.0), Some(1.5));
        assert_eq!(depth_lookup(&depth, 8, 2.0, 2.0), None);
        assert_eq!(depth_lookup(&depth, 8, 100.0, 2.0), None);
    }

    #[test]
    fn test_depth_lookup_interpolates_smooth_surfaces() {
        // A slanted wall: 2000 mm at column 0, +10 mm per column.
        let depth = DepthImage::from_fn(8, 8, |x, _| Luma([2000 + 10 * x as u16]));
        let z = depth_lookup(&depth, 8, 2.25, 3.0).unwrap();
        assert!((z - 2.0225).abs() < 1e-9);
        assert_eq!(depth_lookup(&depth, 8, 7.0, 7.0), Some(2.07));
    }

    #[test]
    fn test_depth_lookup_keeps_nearest_across_depth_edges() {
        let depth = DepthImage::from_fn(8, 8, |x, _| Luma([if x < 4 { 1000 } else { 3000 }]));
        assert_eq!(depth_lookup(&depth, 8, 3.4, 2.0), Some(1.0));
        assert_eq!(depth_lookup(&depth, 8, 3.6, 2.0), Some(3.0));
    }
}
