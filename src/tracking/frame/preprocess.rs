//! Frame preprocessing: undistortion and scale pyramid.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};

use crate::error::{Result, SlamError};

use super::camera::CalibratedCamera;

/// Scale pyramid of undistorted grayscale images. Level 0 is full resolution.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    pub levels: Vec<GrayImage>,
    pub scale_factor: f64,
}

impl ImagePyramid {
    /// Build a pyramid by repeatedly downscaling the base image.
    pub fn build(base: GrayImage, n_levels: usize, scale_factor: f64) -> Self {
        let (w0, h0) = base.dimensions();
        let mut levels = Vec::with_capacity(n_levels);
        levels.push(base);
        for level in 1..n_levels {
            let inv = 1.0 / scale_factor.powi(level as i32);
            let w = ((w0 as f64 * inv).round() as u32).max(1);
            let h = ((h0 as f64 * inv).round() as u32).max(1);
            let resized = imageops::resize(&levels[0], w, h, FilterType::Triangle);
            levels.push(resized);
        }
        Self { levels, scale_factor }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Scale of a level relative to level 0.
    pub fn scale(&self, level: usize) -> f64 {
        self.scale_factor.powi(level as i32)
    }

    /// Map a pixel position on `level` to level-0 coordinates.
    ///
    /// Uses the level's actual size ratio and pixel-centre alignment, which
    /// is how the resampling filter places its samples.
    pub fn to_base(&self, level: usize, x: f32, y: f32) -> (f32, f32) {
        let (w0, h0) = self.levels[0].dimensions();
        let (w, h) = self.levels[level].dimensions();
        let sx = w0 as f32 / w as f32;
        let sy = h0 as f32 / h as f32;
        ((x + 0.5) * sx - 0.5, (y + 0.5) * sy - 0.5)
    }

    pub fn base(&self) -> &GrayImage {
        &self.levels[0]
    }
}

/// Undistort a colour image against its calibration and build the pyramid.
///
/// Fails with [`SlamError::Calibration`] when the image resolution differs
/// from the calibrated one; callers holding images from another resolution
/// must rescale the intrinsics first.
pub fn preprocess(
    raw: &RgbImage,
    camera: &CalibratedCamera,
    n_levels: usize,
    scale_factor: f64,
) -> Result<ImagePyramid> {
    let (w, h) = raw.dimensions();
    if w != camera.width || h != camera.height {
        return Err(SlamError::Calibration(format!(
            "image is {}x{} but calibration expects {}x{}",
            w, h, camera.width, camera.height
        )));
    }
    let gray = imageops::grayscale(raw);
    let undistorted = undistort(&gray, camera);
    Ok(ImagePyramid::build(undistorted, n_levels.max(1), scale_factor))
}

/// Remap a grayscale image to the ideal pinhole image.
pub fn undistort(gray: &GrayImage, camera: &CalibratedCamera) -> GrayImage {
    if !camera.has_distortion() {
        return gray.clone();
    }
    let (w, h) = gray.dimensions();
    let mut out = GrayImage::new(w, h);
    for v in 0..h {
        for u in 0..w {
            let (su, sv) = camera.distort_pixel(u as f64, v as f64);
            let value = sample_bilinear(gray, su, sv).unwrap_or(0.0);
            out.put_pixel(u, v, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Bilinear sample; `None` outside the image.
pub fn sample_bilinear(img: &GrayImage, x: f64, y: f64) -> Option<f64> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f64 || y > (h - 1) as f64 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let p = |xx: u32, yy: u32| img.get_pixel(xx, yy)[0] as f64;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}
