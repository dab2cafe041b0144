//! Descriptor matching and geometric verification.
//!
//! Brute-force Hamming matching with a ratio test, followed by RANSAC
//! verification against either the epipolar constraint (two views, unknown
//! depth) or an absolute pose (2D-3D, map matching).

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};
use crate::geometry::{
    estimate_relative_pose, refine_pose_weighted, solve_pnp_ransac, PnpParams, PnpResult, TwoViewParams,
    TwoViewResult, SE3,
};
use crate::tracking::frame::{CalibratedCamera, Descriptors, KeyPoint};

/// Max descriptor distance for acceptance, per 256 bits.
pub const TH_HIGH: u32 = 100;
/// Stricter threshold, per 256 bits.
pub const TH_LOW: u32 = 50;
/// Ratio test threshold (best/second_best).
pub const NN_RATIO: f32 = 0.75;

/// Hamming distance between two binary descriptors of equal length.
#[inline]
pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Scale a per-256-bit threshold to the actual descriptor length.
pub fn scaled_threshold(th_256: u32, descriptor_len: usize) -> u32 {
    (th_256 as usize * descriptor_len / 32) as u32
}

/// A correspondence between index `a` of the first set and `b` of the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub a: usize,
    pub b: usize,
    pub distance: u32,
}

/// Matching and verification parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Best/second-best distance ratio.
    /// Default: 0.75
    pub nn_ratio: f32,

    /// Maximum Hamming distance per 256 bits.
    /// Default: 100
    pub max_distance: u32,

    /// Minimum verified inliers for a candidate to be accepted.
    /// Default: 10
    pub min_inliers: usize,

    /// RANSAC iterations for both verification models.
    /// Default: 200
    pub ransac_iterations: usize,

    /// Epipolar (Sampson) inlier threshold, pixels.
    /// Default: 2.0
    pub epipolar_threshold_px: f64,

    /// Absolute-pose reprojection inlier threshold, pixels.
    /// Default: 4.0
    pub reprojection_threshold_px: f64,

    /// Seed for the RANSAC sampler.
    /// Default: 7
    pub seed: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            nn_ratio: NN_RATIO,
            max_distance: TH_HIGH,
            min_inliers: 10,
            ransac_iterations: 200,
            epipolar_threshold_px: 2.0,
            reprojection_threshold_px: 4.0,
            seed: 7,
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.nn_ratio > 0.0 && self.nn_ratio <= 1.0) {
            return Err(SlamError::Config(format!(
                "matcher.nn_ratio must be in (0, 1], got {}",
                self.nn_ratio
            )));
        }
        if self.max_distance == 0 || self.max_distance > 256 {
            return Err(SlamError::Config("matcher.max_distance must be in 1..=256".into()));
        }
        if self.min_inliers < 4 {
            return Err(SlamError::Config("matcher.min_inliers must be at least 4".into()));
        }
        if self.ransac_iterations == 0 {
            return Err(SlamError::Config("matcher.ransac_iterations must be positive".into()));
        }
        if !(self.epipolar_threshold_px > 0.0 && self.reprojection_threshold_px > 0.0) {
            return Err(SlamError::Config("matcher thresholds must be positive".into()));
        }
        Ok(())
    }

    pub fn pnp_params(&self) -> PnpParams {
        PnpParams {
            max_iterations: self.ransac_iterations,
            reproj_threshold_px: self.reprojection_threshold_px,
            seed: self.seed,
            ..PnpParams::default()
        }
    }
}

/// Result of an absolute-pose verification.
#[derive(Debug, Clone)]
pub struct PoseVerification {
    /// Camera pose (T_wc).
    pub pose: SE3,
    /// Verified subset of the input matches.
    pub inliers: Vec<Match>,
    /// Number of putative matches that entered verification.
    pub num_matches: usize,
}

/// Result of an epipolar verification.
#[derive(Debug, Clone)]
pub struct EpipolarVerification {
    pub inliers: Vec<Match>,
    pub geometry: TwoViewResult,
}

/// Descriptor matcher with geometric verification.
#[derive(Debug, Clone)]
pub struct DescriptorMatcher {
    config: MatcherConfig,
}

impl DescriptorMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Nearest-neighbour matching from `a` into `b`.
    ///
    /// Each index of `b` is used at most once (the closest `a` wins).
    pub fn match_descriptors(&self, a: &Descriptors, b: &Descriptors) -> Result<Vec<Match>> {
        if a.descriptor_len() != b.descriptor_len() && !a.is_empty() && !b.is_empty() {
            return Err(SlamError::DescriptorLengthMismatch {
                expected: a.descriptor_len(),
                found: b.descriptor_len(),
            });
        }
        let max_dist = scaled_threshold(self.config.max_distance, a.descriptor_len());
        let mut best_for_b: Vec<Option<Match>> = vec![None; b.len()];

        for (ia, da) in a.iter().enumerate() {
            let mut best = u32::MAX;
            let mut second = u32::MAX;
            let mut best_idx = 0;
            for (ib, db) in b.iter().enumerate() {
                let d = hamming(da, db);
                if d < best {
                    second = best;
                    best = d;
                    best_idx = ib;
                } else if d < second {
                    second = d;
                }
            }
            if best > max_dist {
                continue;
            }
            if second != u32::MAX && (best as f32) > self.config.nn_ratio * second as f32 {
                continue;
            }
            let m = Match {
                a: ia,
                b: best_idx,
                distance: best,
            };
            match &best_for_b[best_idx] {
                Some(prev) if prev.distance <= best => {}
                _ => best_for_b[best_idx] = Some(m),
            }
        }

        let mut matches: Vec<Match> = best_for_b.into_iter().flatten().collect();
        matches.sort_by_key(|m| m.a);
        Ok(matches)
    }

    /// Keep the matches consistent with one essential matrix.
    ///
    /// Fails with `InsufficientMatches` below `min_inliers`.
    pub fn verify_epipolar(
        &self,
        kps_a: &[KeyPoint],
        kps_b: &[KeyPoint],
        matches: &[Match],
        camera: &CalibratedCamera,
    ) -> Result<EpipolarVerification> {
        self.require(matches.len())?;
        let x1: Vec<Vector2<f64>> = matches
            .iter()
            .map(|m| camera.normalized(kps_a[m.a].x as f64, kps_a[m.a].y as f64))
            .collect();
        let x2: Vec<Vector2<f64>> = matches
            .iter()
            .map(|m| camera.normalized(kps_b[m.b].x as f64, kps_b[m.b].y as f64))
            .collect();
        let params = TwoViewParams {
            iterations: self.config.ransac_iterations,
            threshold: self.config.epipolar_threshold_px / camera.fx.max(camera.fy),
            seed: self.config.seed,
        };
        let geometry = estimate_relative_pose(&x1, &x2, &params).ok_or(
            SlamError::InsufficientMatches {
                found: 0,
                required: self.config.min_inliers,
            },
        )?;
        let inliers: Vec<Match> = matches
            .iter()
            .zip(&geometry.inliers)
            .filter(|(_, &ok)| ok)
            .map(|(m, _)| *m)
            .collect();
        self.require(inliers.len())?;
        Ok(EpipolarVerification { inliers, geometry })
    }

    /// Keep the matches consistent with one camera pose.
    ///
    /// `points3d[m.b]` is the world point for match `m`, `pixels[m.a]` its
    /// observation. Fails with `InsufficientMatches` below `min_inliers`.
    pub fn verify_absolute_pose(
        &self,
        pixels: &[Vector2<f64>],
        points3d: &[Vector3<f64>],
        matches: &[Match],
        camera: &CalibratedCamera,
        min_inliers: usize,
    ) -> Result<PoseVerification> {
        let required = min_inliers.max(4);
        if matches.len() < required {
            return Err(SlamError::InsufficientMatches {
                found: matches.len(),
                required,
            });
        }
        let pts: Vec<Vector3<f64>> = matches.iter().map(|m| points3d[m.b]).collect();
        let uvs: Vec<Vector2<f64>> = matches.iter().map(|m| pixels[m.a]).collect();
        let PnpResult {
            pose, inlier_mask, ..
        } = solve_pnp_ransac(&pts, &uvs, camera, &self.config.pnp_params()).ok_or(
            SlamError::InsufficientMatches {
                found: 0,
                required,
            },
        )?;
        let inliers: Vec<Match> = matches
            .iter()
            .zip(&inlier_mask)
            .filter(|(_, &ok)| ok)
            .map(|(m, _)| *m)
            .collect();
        if inliers.len() < required {
            return Err(SlamError::InsufficientMatches {
                found: inliers.len(),
                required,
            });
        }
        Ok(PoseVerification {
            pose,
            inliers,
            num_matches: matches.len(),
        })
    }

    /// Refine a known pose against 2D-3D matches without RANSAC.
    ///
    /// `weights` holds one information weight per pixel (indexed like
    /// `pixels`). Matches whose reprojection stays above the threshold at
    /// the refined pose are dropped from the inliers.
    pub fn refine_absolute_pose(
        &self,
        initial_twc: &SE3,
        pixels: &[Vector2<f64>],
        weights: &[f64],
        points3d: &[Vector3<f64>],
        matches: &[Match],
        camera: &CalibratedCamera,
    ) -> PoseVerification {
        let pts: Vec<Vector3<f64>> = matches.iter().map(|m| points3d[m.b]).collect();
        let uvs: Vec<Vector2<f64>> = matches.iter().map(|m| pixels[m.a]).collect();
        let info: Vec<f64> = matches.iter().map(|m| weights.get(m.a).copied().unwrap_or(1.0)).collect();
        let result = refine_pose_weighted(initial_twc, &pts, &uvs, &info, camera, &self.config.pnp_params());
        let inliers = matches
            .iter()
            .zip(&result.inlier_mask)
            .filter(|(_, &ok)| ok)
            .map(|(m, _)| *m)
            .collect();
        PoseVerification {
            pose: result.pose,
            inliers,
            num_matches: matches.len(),
        }
    }

    /// Guided matching: for each projected landmark, the best keypoint
    /// within `radius` pixels. Returns (landmark index, keypoint index) pairs.
    pub fn search_by_projection(
        &self,
        projections: &[(Vector2<f64>, &[u8])],
        keypoints: &[KeyPoint],
        descriptors: &Descriptors,
        radius: f64,
    ) -> Vec<Match> {
        let max_dist = scaled_threshold(self.config.max_distance, descriptors.descriptor_len());
        let r2 = radius * radius;
        let mut taken: Vec<Option<Match>> = vec![None; keypoints.len()];

        for (li, (uv, desc)) in projections.iter().enumerate() {
            let mut best = u32::MAX;
            let mut second = u32::MAX;
            let mut best_idx = None;
            for (ki, kp) in keypoints.iter().enumerate() {
                let du = kp.x as f64 - uv.x;
                let dv = kp.y as f64 - uv.y;
                if du * du + dv * dv > r2 {
                    continue;
                }
                let d = hamming(desc, descriptors.row(ki));
                if d < best {
                    second = best;
                    best = d;
                    best_idx = Some(ki);
                } else if d < second {
                    second = d;
                }
            }
            let Some(ki) = best_idx else {
                continue;
            };
            if best > max_dist {
                continue;
            }
            if second != u32::MAX && (best as f32) > self.config.nn_ratio * second as f32 {
                continue;
            }
            let m = Match {
                a: li,
                b: ki,
                distance: best,
            };
            match &taken[ki] {
                Some(prev) if prev.distance <= best => {}
                _ => taken[ki] = Some(m),
            }
        }
        let mut out: Vec<Match> = taken.into_iter().flatten().collect();
        out.sort_by_key(|m| m.a);
        out
    }

    fn require(&self, found: usize) -> Result<()> {
        if found < self.config.min_inliers {
            return Err(SlamError::InsufficientMatches {
                found,
                required: self.config.min_inliers,
            });
        }
        Ok(())
    }
}
