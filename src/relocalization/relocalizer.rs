//! Single-shot relocalization against a finished (or growing) map.
//!
//! Each query image is preprocessed with intrinsics scaled to its
//! resolution, its features are looked up in the vocabulary without any
//! temporal exclusion, and every candidate keyframe's landmark
//! neighbourhood is matched and verified with RANSAC PnP. The image with
//! the most inliers wins; other images whose pose agrees within the
//! fusion tolerance are averaged into it.

use image::RgbImage;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::atlas::map::KeyFrameId;
use crate::atlas::Atlas;
use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::loop_closing::{match_and_verify, LandmarkSet};
use crate::tracking::frame::{preprocess, CalibratedCamera, ExtractorConfig, FeatureSet, OrbExtractor};
use crate::tracking::matching::{DescriptorMatcher, MatcherConfig, PoseVerification};

/// Relocalization parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocalizationConfig {
    /// Largest accepted number of query images.
    /// Default: 5
    pub max_images: usize,

    /// Vocabulary candidates verified per image.
    /// Default: 5
    pub max_candidates: usize,

    /// Verified inliers for a candidate to count.
    /// Default: 10
    pub min_inliers: usize,

    /// Covisible keyframes whose landmarks join a candidate's match.
    /// Default: 5
    pub covisible_neighbors: usize,

    /// Inlier count at which the count term of the confidence saturates.
    /// Default: 60
    pub confidence_saturation: f64,

    /// Images agreeing with the best within this translation are fused.
    /// Default: 0.05
    pub fuse_translation_m: f64,

    /// Images agreeing with the best within this rotation are fused.
    /// Default: 5.0
    pub fuse_rotation_deg: f64,
}

impl Default for RelocalizationConfig {
    fn default() -> Self {
        Self {
            max_images: 5,
            max_candidates: 5,
            min_inliers: 10,
            covisible_neighbors: 5,
            confidence_saturation: 60.0,
            fuse_translation_m: 0.05,
            fuse_rotation_deg: 5.0,
        }
    }
}

impl RelocalizationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_images == 0 || self.max_candidates == 0 {
            return Err(SlamError::Config("relocalization image and candidate limits must be positive".into()));
        }
        if self.confidence_saturation <= 0.0 {
            return Err(SlamError::Config("relocalization.confidence_saturation must be positive".into()));
        }
        Ok(())
    }
}

/// Result of a successful relocalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Localization {
    /// Camera-to-world pose in the map frame.
    pub pose: SE3,
    /// In [0, 1].
    pub confidence: f64,
    pub num_matches: usize,
    pub num_inliers: usize,
    pub matched_keyframe: KeyFrameId,
    /// Index of the query image that produced `pose`.
    pub image_index: usize,
    /// Images whose pose agreed and was averaged in (at least 1).
    pub fused_images: usize,
}

impl Localization {
    pub fn pose_record(&self) -> PoseRecord {
        PoseRecord::from(&self.pose)
    }
}

/// JSON form of a pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub position: Position,
    pub orientation: Orientation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl From<&SE3> for PoseRecord {
    fn from(pose: &SE3) -> Self {
        let q = pose.rotation.quaternion();
        Self {
            position: Position {
                x: pose.translation.x,
                y: pose.translation.y,
                z: pose.translation.z,
            },
            orientation: Orientation {
                x: q.i,
                y: q.j,
                z: q.k,
                w: q.w,
            },
        }
    }
}

/// Confidence from the inlier ratio and count, clamped to [0, 1].
pub fn confidence(num_inliers: usize, num_matches: usize, saturation: f64) -> f64 {
    if num_matches == 0 {
        return 0.0;
    }
    let ratio = num_inliers as f64 / num_matches as f64;
    let count = (num_inliers as f64 / saturation).min(1.0);
    ((0.2 + 0.8 * ratio) * count).clamp(0.0, 1.0)
}

/// Best verified keyframe for one set of features.
#[derive(Debug, Clone)]
pub struct CandidateMatch {
    pub keyframe: KeyFrameId,
    pub bow_score: f64,
    pub verification: PoseVerification,
}

/// Find the keyframe whose landmarks best explain `features`.
///
/// Fails with `NoLoopClosure` for an empty map and when no candidate
/// passes verification.
pub fn locate(
    atlas: &Atlas,
    features: &FeatureSet,
    camera: &CalibratedCamera,
    matcher: &DescriptorMatcher,
    config: &RelocalizationConfig,
) -> Result<CandidateMatch> {
    if atlas.is_empty() || features.is_empty() {
        return Err(SlamError::NoLoopClosure);
    }
    let map = atlas.map();
    let pixels: Vec<_> = features.keypoints.iter().map(|kp| kp.pt()).collect();

    let mut best: Option<CandidateMatch> = None;
    for (kf_id, bow_score) in atlas
        .vocabulary()
        .query(&features.descriptors, 0)?
        .into_iter()
        .take(config.max_candidates)
    {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        let mut group = kf.get_best_covisibles(config.covisible_neighbors);
        group.push(kf_id);
        let landmarks = LandmarkSet::gather(map, &group);
        match match_and_verify(&pixels, &features.descriptors, &landmarks, matcher, camera, config.min_inliers) {
            Ok(verification) => {
                let better = best
                    .as_ref()
                    .map_or(true, |b| verification.inliers.len() > b.verification.inliers.len());
                if better {
                    best = Some(CandidateMatch {
                        keyframe: kf_id,
                        bow_score,
                        verification,
                    });
                }
            }
            Err(e) if e.is_insufficient_data() => debug!("[Relocalization] {} rejected: {}", kf_id, e),
            Err(e) => return Err(e),
        }
    }
    best.ok_or(SlamError::NoLoopClosure)
}

/// Relocalizes query images against a map.
#[derive(Debug, Clone)]
pub struct Relocalizer {
    config: RelocalizationConfig,
    matcher: DescriptorMatcher,
    extractor: ExtractorConfig,
}

impl Relocalizer {
    pub fn new(config: RelocalizationConfig, matcher: MatcherConfig, extractor: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        matcher.validate()?;
        extractor.validate()?;
        Ok(Self {
            config,
            matcher: DescriptorMatcher::new(matcher),
            extractor,
        })
    }

    pub fn config(&self) -> &RelocalizationConfig {
        &self.config
    }

    /// Recover the camera pose of 1..=`max_images` query images.
    ///
    /// An image whose resolution the map's intrinsics cannot be rescaled to
    /// is skipped; the query fails with that `Calibration` error only when
    /// every image was skipped.
    pub fn localize(&self, atlas: &Atlas, images: &[RgbImage]) -> Result<Localization> {
        if images.is_empty() || images.len() > self.config.max_images {
            return Err(SlamError::InvalidQuery(format!(
                "expected 1..={} images, got {}",
                self.config.max_images,
                images.len()
            )));
        }
        if let Some(i) = images.iter().position(|img| img.width() == 0 || img.height() == 0) {
            return Err(SlamError::InvalidQuery(format!("image {} is empty", i)));
        }
        if atlas.is_empty() {
            return Err(SlamError::NoLoopClosure);
        }

        // Descriptors must match the map's length regardless of the
        // configured extractor.
        let extractor = OrbExtractor::new(ExtractorConfig {
            descriptor_len: atlas.descriptor_len(),
            ..self.extractor.clone()
        })?;

        let mut results: Vec<(usize, CandidateMatch)> = Vec::new();
        let mut calibration_error = None;
        let mut skipped = 0;
        for (i, image) in images.iter().enumerate() {
            let prepared = atlas.camera().scaled_to(image.width(), image.height()).and_then(|camera| {
                let pyramid = preprocess(image, &camera, self.extractor.n_levels, self.extractor.scale_factor)?;
                Ok((camera, pyramid))
            });
            let (camera, pyramid) = match prepared {
                Ok(p) => p,
                Err(e @ SlamError::Calibration(_)) => {
                    warn!("[Relocalization] image {} skipped: {}", i, e);
                    skipped += 1;
                    calibration_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let features = extractor.extract(&pyramid);
            match locate(atlas, &features, &camera, &self.matcher, &self.config) {
                Ok(found) => {
                    debug!(
                        "[Relocalization] image {}: {} with {}/{} inliers",
                        i,
                        found.keyframe,
                        found.verification.inliers.len(),
                        found.verification.num_matches
                    );
                    results.push((i, found));
                }
                Err(SlamError::NoLoopClosure) => debug!("[Relocalization] image {}: no candidate verified", i),
                Err(e) => return Err(e),
            }
        }

        let Some(best_idx) = (0..results.len()).max_by_key(|&k| results[k].1.verification.inliers.len()) else {
            info!("[Relocalization] failed for {} images", images.len());
            return match calibration_error {
                Some(e) if skipped == images.len() => Err(e),
                _ => Err(SlamError::NoLoopClosure),
            };
        };
        let (image_index, best) = &results[best_idx];
        let agreeing: Vec<&CandidateMatch> = results
            .iter()
            .map(|(_, r)| r)
            .filter(|r| {
                r.verification.pose.distance_to(&best.verification.pose) <= self.config.fuse_translation_m
                    && r.verification.pose.angle_to(&best.verification.pose).to_degrees() <= self.config.fuse_rotation_deg
            })
            .collect();

        let pose = fuse_poses(&agreeing);
        let num_inliers = best.verification.inliers.len();
        let num_matches = best.verification.num_matches;
        let loc = Localization {
            pose,
            confidence: confidence(num_inliers, num_matches, self.config.confidence_saturation),
            num_matches,
            num_inliers,
            matched_keyframe: best.keyframe,
            image_index: *image_index,
            fused_images: agreeing.len(),
        };
        info!(
            "[Relocalization] localized against {} (confidence {:.2}, {} images fused)",
            loc.matched_keyframe, loc.confidence, loc.fused_images
        );
        Ok(loc)
    }
}

/// Inlier-weighted average of agreeing poses.
fn fuse_poses(poses: &[&CandidateMatch]) -> SE3 {
    let mut translation = Vector3::zeros();
    let mut total = 0.0;
    let mut rotation: Option<UnitQuaternion<f64>> = None;
    for c in poses {
        let w = c.verification.inliers.len() as f64;
        translation += c.verification.pose.translation * w;
        total += w;
        let q = c.verification.pose.rotation;
        rotation = Some(match rotation {
            None => q,
            // Running weighted average on the geodesic.
            Some(acc) => acc.slerp(&q, w / total),
        });
    }
    match rotation {
        Some(q) if total > 0.0 => SE3::new(q, translation / total),
        _ => SE3::identity(),
    }
}
