//! Coloured point cloud export for external viewers.
//!
//! Keyframes built from depth-carrying frames keep a stride-subsampled
//! depth and colour sample; those samples are back-projected through the
//! (optimized) keyframe poses. Maps without any depth keyframe fall back to
//! the sparse landmarks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nalgebra::Vector3;
use serde::Serialize;
use tracing::info;

use crate::atlas::Atlas;
use crate::error::Result;
use crate::tracking::tracking_frame::DepthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CloudPoint {
    pub position: Vector3<f64>,
    pub color: [u8; 3],
}

/// Dense cloud with the default depth trust range.
///
/// At most `max_points` points are returned (0 means unlimited); larger
/// clouds are subsampled with a uniform stride.
pub fn export_dense_cloud(atlas: &Atlas, max_points: usize) -> Vec<CloudPoint> {
    export_dense_cloud_with(atlas, &DepthConfig::default(), max_points)
}

pub fn export_dense_cloud_with(atlas: &Atlas, depth: &DepthConfig, max_points: usize) -> Vec<CloudPoint> {
    let camera = atlas.camera();
    let mut points = Vec::new();
    for kf in atlas.map().keyframes() {
        let Some(dense) = &kf.dense else {
            continue;
        };
        for j in 0..dense.height {
            for i in 0..dense.width {
                let idx = (j * dense.width + i) as usize;
                let mm = dense.depth_mm[idx];
                if mm == 0 {
                    continue;
                }
                let z = mm as f64 / 1000.0;
                if !depth.is_trusted(z) {
                    continue;
                }
                let px = dense.pixel(i, j);
                let (u, v) = if camera.has_distortion() {
                    camera.undistort_pixel(px.x, px.y)
                } else {
                    (px.x, px.y)
                };
                let p_cam = camera.unproject(u, v, z);
                points.push(CloudPoint {
                    position: kf.pose.transform_point(&p_cam),
                    color: dense.rgb[idx],
                });
            }
        }
    }

    if points.is_empty() {
        points = atlas
            .map()
            .map_points()
            .map(|mp| CloudPoint {
                position: mp.position,
                color: mp.color,
            })
            .collect();
    }

    let points = subsample(points, max_points);
    info!("[Export] dense cloud: {} points", points.len());
    points
}

fn subsample(points: Vec<CloudPoint>, max_points: usize) -> Vec<CloudPoint> {
    if max_points == 0 || points.len() <= max_points {
        return points;
    }
    let stride = points.len().div_ceil(max_points);
    points.into_iter().step_by(stride).collect()
}

/// Write points as ASCII PLY.
pub fn write_ply(points: &[CloudPoint], path: impl AsRef<Path>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_ply_to(points, &mut out)?;
    out.flush()?;
    Ok(())
}

pub fn write_ply_to<W: Write>(points: &[CloudPoint], out: &mut W) -> Result<()> {
    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {}", points.len())?;
    for prop in ["x", "y", "z"] {
        writeln!(out, "property float {}", prop)?;
    }
    for prop in ["red", "green", "blue"] {
        writeln!(out, "property uchar {}", prop)?;
    }
    writeln!(out, "end_header")?;
    for p in points {
        writeln!(
            out,
            "{:.5} {:.5} {:.5} {} {} {}",
            p.position.x, p.position.y, p.position.z, p.color[0], p.color[1], p.color[2]
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::{DenseSample, NewKeyFrame};
    use crate::geometry::SE3;
    use crate::tracking::frame::{CalibratedCamera, FeatureSet};
    use crate::vocabulary::VocabularyConfig;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn atlas_with_dense(depth_mm: Vec<u16>) -> Atlas {
        let camera = CalibratedCamera::pinhole(100.0, 100.0, 0.0, 0.0, 20, 10);
        let mut atlas = Atlas::new(camera, 32, VocabularyConfig::default()).unwrap();
        let dense = DenseSample {
            stride: 10,
            width: 2,
            height: 1,
            rgb: vec![[255, 0, 0], [0, 255, 0]],
            depth_mm,
        };
        atlas
            .insert_keyframe(NewKeyFrame {
                timestamp_ns: 0,
                pose: SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 0.0, 1.0)),
                features: FeatureSet::default(),
                depths: Vec::new(),
                colors: Vec::new(),
                dense: Some(dense),
            })
            .unwrap();
        atlas
    }

    #[test]
    fn test_back_projects_through_pose() {
        let cloud = export_dense_cloud(&atlas_with_dense(vec![2000, 1000]), 0);
        assert_eq!(cloud.len(), 2);
        assert_relative_eq!(cloud[0].position, Vector3::new(0.0, 0.0, 3.0), epsilon = 1e-9);
        assert_relative_eq!(cloud[1].position, Vector3::new(0.1, 0.0, 2.0), epsilon = 1e-9);
        assert_eq!(cloud[1].color, [0, 255, 0]);
    }

    #[test]
    fn test_invalid_depth_is_skipped() {
        let cloud = export_dense_cloud(&atlas_with_dense(vec![0, 9000]), 0);
        assert!(cloud.is_empty());
    }

    #[test]
    fn test_subsample_caps_points() {
        let points: Vec<CloudPoint> = (0..10)
            .map(|i| CloudPoint {
                position: Vector3::new(i as f64, 0.0, 0.0),
                color: [0; 3],
            })
            .collect();
        let kept = subsample(points, 3);
        assert!(kept.len() <= 3);
        assert_eq!(kept[0].position.x, 0.0);
    }

    #[test]
    fn test_ply_header() {
        let mut buf = Vec::new();
        let p = CloudPoint {
            position: Vector3::new(1.0, 2.0, 3.0),
            color: [1, 2, 3],
        };
        write_ply_to(&[p], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("ply\nformat ascii 1.0\nelement vertex 1\n"));
        assert!(text.ends_with("1.00000 2.00000 3.00000 1 2 3\n"));
    }
}
