//! Tracking `TrackingFrame` representation.
//!
//! This is distinct from [`Frame`], which is the raw capture delivered by
//! the ingestion boundary. A `TrackingFrame` is what the Tracker operates
//! on: undistorted features, the sensor depth under each keypoint (when the
//! session trusts its depth), keypoint colours and an optional dense depth
//! sample for point-cloud export.

use serde::{Deserialize, Serialize};

use crate::atlas::map::DenseSample;
use crate::error::{Result, SlamError};
use crate::tracking::frame::{depth_lookup, preprocess, CalibratedCamera, FeatureSet, Frame, OrbExtractor};

/// Whether a session's depth channel is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DepthSource {
    /// Monocular: depth images are ignored.
    Absent,
    /// Depth readings are back-projected directly. Frames without depth are
    /// processed monocularly.
    #[default]
    Trusted,
}

/// Depth sensor trust range and dense sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    /// Closest trusted reading, metres.
    /// Default: 0.3
    pub min_depth_m: f64,

    /// Farthest trusted reading, metres.
    /// Default: 4.0
    pub max_depth_m: f64,

    /// Pixel stride of the dense sample kept on KeyFrames for cloud export.
    /// 0 disables dense sampling.
    /// Default: 4
    pub dense_stride: u32,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            min_depth_m: 0.3,
            max_depth_m: 4.0,
            dense_stride: 4,
        }
    }
}

impl DepthConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_depth_m > 0.0 && self.max_depth_m > self.min_depth_m) {
            return Err(SlamError::Config(format!(
                "depth range [{}, {}] is empty or non-positive",
                self.min_depth_m, self.max_depth_m
            )));
        }
        Ok(())
    }

    /// A reading usable for back-projection: finite, non-zero, in range.
    pub fn is_trusted(&self, depth_m: f64) -> bool {
        depth_m.is_finite() && depth_m >= self.min_depth_m && depth_m <= self.max_depth_m
    }
}

/// A frame being tracked (not yet a KeyFrame).
#[derive(Debug, Clone)]
pub struct TrackingFrame {
    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Undistorted features.
    pub features: FeatureSet,
    /// Trusted metric depth per keypoint.
    pub depths: Vec<Option<f64>>,
    /// Colour under each keypoint.
    pub colors: Vec<[u8; 3]>,
    /// Dense depth sample (depth frames only).
    pub dense: Option<DenseSample>,
}

impl TrackingFrame {
    /// Preprocess and extract a raw frame.
    pub fn new(
        frame: &Frame,
        camera: &CalibratedCamera,
        extractor: &OrbExtractor,
        depth_config: &DepthConfig,
        depth_source: DepthSource,
    ) -> Result<Self> {
        frame.validate()?;
        let config = extractor.config();
        let pyramid = preprocess(&frame.color, camera, config.n_levels, config.scale_factor)?;
        let features = extractor.extract(&pyramid);

        let depth = match depth_source {
            DepthSource::Trusted => frame.depth.as_ref(),
            DepthSource::Absent => None,
        };
        let width = frame.color.width();
        let mut depths = Vec::with_capacity(features.len());
        let mut colors = Vec::with_capacity(features.len());
        for kp in &features.keypoints {
            // Keypoints live on the undistorted grid; depth and colour on the raw one.
            let (u, v) = camera.distort_pixel(kp.x as f64, kp.y as f64);
            depths.push(
                depth
                    .and_then(|d| depth_lookup(d, width, u, v))
                    .filter(|z| depth_config.is_trusted(*z)),
            );
            colors.push(color_at(frame, u, v));
        }

        let dense = match depth {
            Some(d) if depth_config.dense_stride > 0 => Some(dense_sample(frame, d, depth_config.dense_stride)),
            _ => None,
        };

        Ok(Self {
            timestamp_ns: frame.timestamp_ns,
            features,
            depths,
            colors,
            dense,
        })
    }

    /// Number of features in this frame.
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Number of keypoints with a trusted depth reading.
    pub fn num_depth_features(&self) -> usize {
        self.depths.iter().filter(|d| d.is_some()).count()
    }

    pub fn has_depth(&self) -> bool {
        self.num_depth_features() > 0
    }
}

fn color_at(frame: &Frame, u: f64, v: f64) -> [u8; 3] {
    let x = u.round().clamp(0.0, (frame.color.width() - 1) as f64) as u32;
    let y = v.round().clamp(0.0, (frame.color.height() - 1) as f64) as u32;
    frame.color.get_pixel(x, y).0
}

fn dense_sample(frame: &Frame, depth: &crate::tracking::frame::DepthImage, stride: u32) -> DenseSample {
    let width = frame.color.width().div_ceil(stride);
    let height = frame.color.height().div_ceil(stride);
    let mut depth_mm = Vec::with_capacity((width * height) as usize);
    let mut rgb = Vec::with_capacity((width * height) as usize);
    for j in 0..height {
        for i in 0..width {
            let (u, v) = ((i * stride) as f64, (j * stride) as f64);
            let mm = depth_lookup(depth, frame.color.width(), u, v)
                .map(|z| (z * 1000.0).round() as u16)
                .unwrap_or(0);
            depth_mm.push(mm);
            rgb.push(color_at(frame, u, v));
        }
    }
    DenseSample {
        stride,
        width,
        height,
        depth_mm,
        rgb,
    }
}
