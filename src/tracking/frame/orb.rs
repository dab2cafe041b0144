//! ORB feature extraction: FAST corners on every pyramid level, grid-based
//! distribution, intensity-centroid orientation and steered BRIEF descriptors.

use std::f64::consts::PI;

use image::imageops;
use image::GrayImage;
use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};

use super::preprocess::ImagePyramid;

/// Radius of the orientation patch.
pub const HALF_PATCH_SIZE: i32 = 15;

/// Pixels kept free at the image border so that every BRIEF test stays inside.
const EDGE_THRESHOLD: i32 = 19;

/// Maximum coordinate of a BRIEF test point before rotation.
const PATTERN_EXTENT: i32 = 13;

/// Seed for the BRIEF test pattern. Changing it invalidates every stored map.
const PATTERN_SEED: u64 = 0x0b5e_55ed;

/// Bresenham circle of radius 3 used by FAST.
const FAST_RING: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

/// Contiguous arc length required by FAST-9.
const FAST_ARC: usize = 9;

/// Supported descriptor lengths in bytes.
pub const DESCRIPTOR_LENGTHS: [usize; 2] = [32, 64];

// ─────────────────────────────────────────────────────────────────────────────
// Keypoints and descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// A detected keypoint. Coordinates are in level-0 pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the keypoint was detected on.
    pub level: u8,
    /// Orientation in radians.
    pub angle: f32,
    pub response: f32,
}

impl KeyPoint {
    pub fn pt(&self) -> Vector2<f64> {
        Vector2::new(self.x as f64, self.y as f64)
    }
}

/// Row-major matrix of fixed-length binary descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptors {
    descriptor_len: usize,
    data: Vec<u8>,
}

impl Descriptors {
    /// Empty set of descriptors of the given byte length.
    pub fn new(descriptor_len: usize) -> Self {
        Self {
            descriptor_len,
            data: Vec::new(),
        }
    }

    /// Append one descriptor; its length must match the set.
    pub fn push(&mut self, row: &[u8]) -> Result<()> {
        if row.len() != self.descriptor_len {
            return Err(SlamError::DescriptorLengthMismatch {
                expected: self.descriptor_len,
                found: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    /// Build from individual rows.
    pub fn from_rows<R: AsRef<[u8]>>(descriptor_len: usize, rows: &[R]) -> Result<Self> {
        let mut out = Self::new(descriptor_len);
        for row in rows {
            out.push(row.as_ref())?;
        }
        Ok(out)
    }

    pub fn row(&self, i: usize) -> &[u8] {
        &self.data[i * self.descriptor_len..(i + 1) * self.descriptor_len]
    }

    pub fn get(&self, i: usize) -> Option<&[u8]> {
        if i < self.len() {
            Some(self.row(i))
        } else {
            None
        }
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        if self.descriptor_len == 0 {
            0
        } else {
            self.data.len() / self.descriptor_len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of each descriptor in bytes.
    pub fn descriptor_len(&self) -> usize {
        self.descriptor_len
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.descriptor_len.max(1))
    }

    /// Subset of rows, in the given order.
    pub fn select(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.descriptor_len);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            descriptor_len: self.descriptor_len,
            data,
        }
    }
}

/// Keypoints with their descriptors, index-aligned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Descriptors,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Indices of keypoints within `radius` pixels of (u, v).
    pub fn features_in_area(&self, u: f64, v: f64, radius: f64) -> Vec<usize> {
        let r2 = radius * radius;
        self.keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| {
                let du = kp.x as f64 - u;
                let dv = kp.y as f64 - v;
                du * du + dv * dv <= r2
            })
            .map(|(i, _)| i)
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Feature extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Target number of features per frame.
    /// Default: 1000
    pub n_features: usize,

    /// Number of pyramid levels.
    /// Default: 8
    pub n_levels: usize,

    /// Downscale factor between consecutive levels.
    /// Default: 1.2
    pub scale_factor: f64,

    /// FAST threshold for strong corners.
    /// Default: 20
    pub ini_fast_threshold: u8,

    /// FAST threshold used when a grid cell has no strong corner.
    /// Default: 7
    pub min_fast_threshold: u8,

    /// Descriptor length in bytes (32 or 64). Fixed for a whole map.
    /// Default: 32
    pub descriptor_len: usize,

    /// Side of the distribution grid cells in pixels.
    /// Default: 30
    pub grid_cell_size: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            n_features: 1000,
            n_levels: 8,
            scale_factor: 1.2,
            ini_fast_threshold: 20,
            min_fast_threshold: 7,
            descriptor_len: 32,
            grid_cell_size: 30,
        }
    }
}

impl ExtractorConfig {
    pub fn validate(&self) -> Result<()> {
        if !DESCRIPTOR_LENGTHS.contains(&self.descriptor_len) {
            return Err(SlamError::Config(format!(
                "descriptor_len must be 32 or 64, got {}",
                self.descriptor_len
            )));
        }
        if self.n_levels == 0 {
            return Err(SlamError::Config("n_levels must be at least 1".into()));
        }
        if !(self.scale_factor > 1.0) {
            return Err(SlamError::Config(format!(
                "scale_factor must be > 1, got {}",
                self.scale_factor
            )));
        }
        if self.n_features == 0 {
            return Err(SlamError::Config("n_features must be positive".into()));
        }
        if self.min_fast_threshold == 0 || self.min_fast_threshold > self.ini_fast_threshold {
            return Err(SlamError::Config(
                "fast thresholds must satisfy 0 < min <= ini".into(),
            ));
        }
        if self.grid_cell_size < 8 {
            return Err(SlamError::Config("grid_cell_size must be at least 8".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extractor
// ─────────────────────────────────────────────────────────────────────────────

/// FAST corner candidate on one pyramid level.
#[derive(Debug, Clone, Copy)]
struct ScoredCorner {
    x: i32,
    y: i32,
    score: f32,
    strong: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CornerType {
    Bright,
    Dark,
    None,
}

/// ORB extractor with a fixed BRIEF test pattern.
pub struct OrbExtractor {
    config: ExtractorConfig,
    /// Test point pairs (ax, ay, bx, by), one per descriptor bit.
    pattern: Vec<[i8; 4]>,
    /// Circle half-widths for the orientation patch, indexed by |dy|.
    umax: Vec<i32>,
}

impl OrbExtractor {
    pub fn new(config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        let pattern = brief_pattern(config.descriptor_len * 8);
        let umax = (0..=HALF_PATCH_SIZE)
            .map(|v| {
                let r = HALF_PATCH_SIZE as f64;
                ((r * r - (v * v) as f64).sqrt()).floor() as i32
            })
            .collect();
        Ok(Self {
            config,
            pattern,
            umax,
        })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn descriptor_len(&self) -> usize {
        self.config.descriptor_len
    }

    /// Extract keypoints and descriptors from a pyramid.
    pub fn extract(&self, pyramid: &ImagePyramid) -> FeatureSet {
        let n_levels = pyramid.num_levels();
        let quotas = level_quotas(self.config.n_features, n_levels, pyramid.scale_factor);

        let mut keypoints = Vec::with_capacity(self.config.n_features);
        let mut descriptors = Descriptors::new(self.config.descriptor_len);
        let mut row = vec![0u8; self.config.descriptor_len];

        for (level, img) in pyramid.levels.iter().enumerate() {
            let (w, h) = img.dimensions();
            if (w as i32) <= 2 * EDGE_THRESHOLD || (h as i32) <= 2 * EDGE_THRESHOLD {
                break;
            }
            let corners = self.detect_level(img, quotas[level]);
            if corners.is_empty() {
                continue;
            }
            let blurred = imageops::blur(img, 2.0);

            for (corner, (dx, dy)) in corners {
                let angle = self.ic_angle(img, corner.x, corner.y);
                self.compute_descriptor(&blurred, corner.x, corner.y, angle, &mut row);
                let (x, y) = pyramid.to_base(level, corner.x as f32 + dx, corner.y as f32 + dy);
                keypoints.push(KeyPoint {
                    x,
                    y,
                    level: level as u8,
                    angle: angle as f32,
                    response: corner.score,
                });
                // Row length always equals the configured descriptor length.
                descriptors.data.extend_from_slice(&row);
            }
        }

        FeatureSet {
            keypoints,
            descriptors,
        }
    }

    /// Detect, suppress and distribute FAST corners on one level.
    ///
    /// Returns the kept corners with their sub-pixel offsets.
    fn detect_level(&self, img: &GrayImage, quota: usize) -> Vec<(ScoredCorner, (f32, f32))> {
        let (w, h) = img.dimensions();
        let (w, h) = (w as i32, h as i32);
        let min_th = self.config.min_fast_threshold;
        let ini_th = self.config.ini_fast_threshold;

        let border = EDGE_THRESHOLD;
        let mut scores = vec![0f32; (w * h) as usize];
        let mut candidates = Vec::new();
        for y in border..h - border {
            for x in border..w - border {
                if let Some(score) = fast_score(img, x, y, min_th) {
                    scores[(y * w + x) as usize] = score;
                    candidates.push((x, y, score));
                }
            }
        }

        // 3x3 non-maximum suppression on the score map.
        let score_at = |x: i32, y: i32| scores[(y * w + x) as usize];
        let mut corners: Vec<ScoredCorner> = candidates
            .into_iter()
            .filter(|&(x, y, s)| {
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        if (dx != 0 || dy != 0) && score_at(x + dx, y + dy) > s {
                            return false;
                        }
                    }
                }
                true
            })
            .map(|(x, y, score)| ScoredCorner {
                x,
                y,
                score,
                strong: fast_score(img, x, y, ini_th).is_some(),
            })
            .collect();

        if corners.is_empty() || quota == 0 {
            return Vec::new();
        }

        // Grid distribution: rank corners inside their cell (strong corners
        // first, then by score) and take rank 0 of every cell before rank 1.
        let cell = self.config.grid_cell_size as i32;
        let cols = ((w - 2 * border) + cell - 1) / cell;
        let cell_of = |c: &ScoredCorner| ((c.y - border) / cell) * cols + (c.x - border) / cell;
        corners.sort_by(|a, b| {
            cell_of(a)
                .cmp(&cell_of(b))
                .then(b.strong.cmp(&a.strong))
                .then(b.score.total_cmp(&a.score))
        });
        let mut ranked: Vec<(usize, ScoredCorner)> = Vec::with_capacity(corners.len());
        let mut rank = 0usize;
        let mut prev_cell = None;
        for c in corners {
            let cid = cell_of(&c);
            if prev_cell == Some(cid) {
                rank += 1;
            } else {
                rank = 0;
                prev_cell = Some(cid);
            }
            ranked.push((rank, c));
        }
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.strong.cmp(&a.1.strong))
                .then(b.1.score.total_cmp(&a.1.score))
        });
        ranked.truncate(quota);

        ranked
            .into_iter()
            .map(|(_, c)| {
                let dx = parabola_offset(score_at(c.x - 1, c.y), c.score, score_at(c.x + 1, c.y));
                let dy = parabola_offset(score_at(c.x, c.y - 1), c.score, score_at(c.x, c.y + 1));
                (c, (dx, dy))
            })
            .collect()
    }

    /// Orientation by intensity centroid over a circular patch.
    fn ic_angle(&self, img: &GrayImage, x: i32, y: i32) -> f64 {
        let mut m01 = 0i64;
        let mut m10 = 0i64;
        let px = |xx: i32, yy: i32| img.get_pixel(xx as u32, yy as u32)[0] as i64;
        for u in -HALF_PATCH_SIZE..=HALF_PATCH_SIZE {
            m10 += u as i64 * px(x + u, y);
        }
        for v in 1..=HALF_PATCH_SIZE {
            let d = self.umax[v as usize];
            let mut v_sum = 0i64;
            for u in -d..=d {
                let above = px(x + u, y - v);
                let below = px(x + u, y + v);
                v_sum += below - above;
                m10 += u as i64 * (below + above);
            }
            m01 += v as i64 * v_sum;
        }
        (m01 as f64).atan2(m10 as f64)
    }

    /// Steered BRIEF on the smoothed level image.
    fn compute_descriptor(&self, blurred: &GrayImage, x: i32, y: i32, angle: f64, out: &mut [u8]) {
        let (s, c) = angle.sin_cos();
        let sample = |px: i8, py: i8| -> u8 {
            let rx = (px as f64 * c - py as f64 * s).round() as i32;
            let ry = (px as f64 * s + py as f64 * c).round() as i32;
            blurred.get_pixel((x + rx) as u32, (y + ry) as u32)[0]
        };
        out.iter_mut().for_each(|b| *b = 0);
        for (bit, t) in self.pattern.iter().enumerate() {
            if sample(t[0], t[1]) < sample(t[2], t[3]) {
                out[bit / 8] |= 1 << (bit % 8);
            }
        }
    }
}

/// Split the feature budget over levels as a geometric series.
fn level_quotas(n_features: usize, n_levels: usize, scale_factor: f64) -> Vec<usize> {
    let inv = 1.0 / scale_factor;
    let first = n_features as f64 * (1.0 - inv) / (1.0 - inv.powi(n_levels as i32));
    let mut quotas = Vec::with_capacity(n_levels);
    let mut assigned = 0usize;
    for level in 0..n_levels.saturating_sub(1) {
        let q = (first * inv.powi(level as i32)).round() as usize;
        quotas.push(q);
        assigned += q;
    }
    quotas.push(n_features.saturating_sub(assigned));
    quotas
}

/// FAST-9 test; returns a score for corners, `None` otherwise.
fn fast_score(img: &GrayImage, x: i32, y: i32, threshold: u8) -> Option<f32> {
    let center = img.get_pixel(x as u32, y as u32)[0] as i16;
    let t = threshold as i16;
    let ring: [i16; 16] = std::array::from_fn(|i| {
        let (dx, dy) = FAST_RING[i];
        img.get_pixel((x + dx) as u32, (y + dy) as u32)[0] as i16
    });
    let classify = |v: i16| {
        if v > center + t {
            CornerType::Bright
        } else if v < center - t {
            CornerType::Dark
        } else {
            CornerType::None
        }
    };

    // Any 9-arc covers at least two of the four compass pixels.
    let compass = [ring[0], ring[4], ring[8], ring[12]].map(classify);
    let bright = compass.iter().filter(|&&c| c == CornerType::Bright).count();
    let dark = compass.iter().filter(|&&c| c == CornerType::Dark).count();
    if bright < 2 && dark < 2 {
        return None;
    }

    for kind in [CornerType::Bright, CornerType::Dark] {
        let mut run = 0usize;
        let mut found = false;
        for i in 0..16 + FAST_ARC {
            if classify(ring[i % 16]) == kind {
                run += 1;
                if run >= FAST_ARC {
                    found = true;
                    break;
                }
            } else {
                run = 0;
            }
        }
        if found {
            let score: i16 = ring
                .iter()
                .filter(|&&v| classify(v) == kind)
                .map(|&v| (v - center).abs() - t)
                .sum();
            return Some(score as f32);
        }
    }
    None
}

/// Vertex offset of a parabola through three samples, clamped to half a pixel.
fn parabola_offset(left: f32, center: f32, right: f32) -> f32 {
    let denom = left - 2.0 * center + right;
    if denom.abs() < 1e-6 {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

/// Deterministic BRIEF test pattern. The first 256 pairs are shared by the
/// 32- and 64-byte variants.
fn brief_pattern(n_bits: usize) -> Vec<[i8; 4]> {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    let mut sample = || -> i8 {
        // Sum of two uniforms: a cheap bell shape concentrated at the centre.
        let a: f64 = rng.gen_range(-1.0..1.0);
        let b: f64 = rng.gen_range(-1.0..1.0);
        let v = (a + b) * 0.5 * PATTERN_EXTENT as f64 * 1.3;
        v.round().clamp(-PATTERN_EXTENT as f64, PATTERN_EXTENT as f64) as i8
    };
    (0..n_bits)
        .map(|_| {
            let mut t = [sample(), sample(), sample(), sample()];
            while t[0] == t[2] && t[1] == t[3] {
                t[2] = sample();
                t[3] = sample();
            }
            t
        })
        .collect()
}

/// Convert an angle to the [-π, π] range.
pub fn wrap_angle(a: f64) -> f64 {
    let mut a = a % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a < -PI {
        a += 2.0 * PI;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Checkerboard of 16px squares with a few darker blocks to break symmetry.
    fn textured_image(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let cx = x / 16;
            let cy = y / 16;
            let base = if (cx + cy) % 2 == 0 { 40 } else { 210 };
            let v = if (cx * 7 + cy * 13) % 5 == 0 { base / 2 + 20 } else { base };
            Luma([v as u8])
        })
    }

    fn extractor(desc_len: usize, n_features: usize) -> OrbExtractor {
        OrbExtractor::new(ExtractorConfig {
            n_features,
            n_levels: 4,
            descriptor_len: desc_len,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_level_quotas_sum_to_target() {
        let q = level_quotas(1000, 8, 1.2);
        assert_eq!(q.len(), 8);
        assert_eq!(q.iter().sum::<usize>(), 1000);
        assert!(q[0] > q[7]);
    }

    #[test]
    fn test_fast_detects_square_corner() {
        let mut img = GrayImage::from_pixel(40, 40, Luma([200]));
        for y in 20..40 {
            for x in 20..40 {
                img.put_pixel(x, y, Luma([20]));
            }
        }
        assert!(fast_score(&img, 20, 20, 20).is_some());
        assert!(fast_score(&img, 10, 10, 20).is_none());
        assert!(fast_score(&img, 30, 20, 20).is_none());
    }

    #[test]
    fn test_extract_descriptor_lengths() {
        let pyr = ImagePyramid::build(textured_image(200, 160), 4, 1.2);
        for len in DESCRIPTOR_LENGTHS {
            let features = extractor(len, 300).extract(&pyr);
            assert!(!features.is_empty());
            assert_eq!(features.descriptors.descriptor_len(), len);
            assert_eq!(features.descriptors.len(), features.keypoints.len());
            assert!(features.len() <= 300);
        }
    }

    #[test]
    fn test_extract_is_deterministic() {
        let pyr = ImagePyramid::build(textured_image(200, 160), 4, 1.2);
        let ex = extractor(32, 300);
        let a = ex.extract(&pyr);
        let b = ex.extract(&pyr);
        assert_eq!(a.descriptors, b.descriptors);
        assert_eq!(a.keypoints, b.keypoints);
    }

    #[test]
    fn test_features_spread_over_image() {
        let pyr = ImagePyramid::build(textured_image(240, 240), 1, 1.2);
        let features = extractor(32, 200).extract(&pyr);
        let left = features.keypoints.iter().filter(|k| k.x < 120.0).count();
        let right = features.len() - left;
        assert!(left > features.len() / 4, "left={} right={}", left, right);
        assert!(right > features.len() / 4, "left={} right={}", left, right);
    }

    #[test]
    fn test_descriptor_push_rejects_wrong_length() {
        let mut d = Descriptors::new(32);
        assert!(d.push(&[0u8; 32]).is_ok());
        assert!(matches!(
            d.push(&[0u8; 64]),
            Err(SlamError::DescriptorLengthMismatch { expected: 32, found: 64 })
        ));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_config_rejects_unsupported_length() {
        let config = ExtractorConfig {
            descriptor_len: 48,
            ..Default::default()
        };
        assert!(matches!(OrbExtractor::new(config), Err(SlamError::Config(_))));
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(3.0 * PI) - PI).abs() < 1e-9);
        assert!((wrap_angle(-0.5) + 0.5).abs() < 1e-12);
    }
}
