//! Keyframe trajectory and map metadata export.

use std::io::Write;
use std::path::Path;

use nalgebra::Vector3;
use serde::Serialize;

use crate::atlas::Atlas;
use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::relocalization::PoseRecord;

/// Keyframe trajectory in TUM format (`timestamp tx ty tz qx qy qz qw`,
/// timestamp in seconds), ordered by keyframe creation.
pub fn write_tum_trajectory<W: Write>(atlas: &Atlas, out: W) -> Result<()> {
    let poses = atlas.map().keyframes().map(|kf| (kf.timestamp_ns, kf.pose.clone()));
    write_tum(poses, out)
}

pub fn write_tum_trajectory_file(atlas: &Atlas, path: impl AsRef<Path>) -> Result<()> {
    write_tum_trajectory(atlas, std::fs::File::create(path)?)
}

/// Any `(timestamp_ns, T_wc)` sequence in TUM format.
pub fn write_tum<W: Write>(poses: impl IntoIterator<Item = (u64, SE3)>, out: W) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_writer(out);
    for (ts, pose) in poses {
        let t = pose.translation;
        let q = pose.rotation.quaternion();
        writer
            .write_record(&[
                format!("{:.9}", ts as f64 * 1e-9),
                format!("{:.6}", t.x),
                format!("{:.6}", t.y),
                format!("{:.6}", t.z),
                format!("{:.6}", q.i),
                format!("{:.6}", q.j),
                format!("{:.6}", q.k),
                format!("{:.6}", q.w),
            ])
            .map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_error(e: csv::Error) -> SlamError {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => SlamError::Io(io),
        other => SlamError::MapFormat(format!("{:?}", other)),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyFrameSummary {
    pub id: u64,
    pub timestamp_ns: u64,
    pub pose: PoseRecord,
    pub num_landmarks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

/// Human-readable description of a map.
#[derive(Debug, Clone, Serialize)]
pub struct MapSummary {
    pub num_keyframes: usize,
    pub num_landmarks: usize,
    pub num_loop_edges: usize,
    pub descriptor_len: usize,
    pub image_width: u32,
    pub image_height: u32,
    /// Sum of distances between consecutive keyframe centres, metres.
    pub trajectory_length_m: f64,
    /// Extent of the landmarks; absent for maps without landmarks.
    pub bounds: Option<BoundingBox>,
    pub keyframes: Vec<KeyFrameSummary>,
}

impl MapSummary {
    pub fn from_atlas(atlas: &Atlas) -> Self {
        let map = atlas.map();
        let keyframes: Vec<KeyFrameSummary> = map
            .keyframes()
            .map(|kf| KeyFrameSummary {
                id: kf.id.0,
                timestamp_ns: kf.timestamp_ns,
                pose: PoseRecord::from(&kf.pose),
                num_landmarks: kf.num_map_points(),
            })
            .collect();

        let centres: Vec<Vector3<f64>> = map.keyframes().map(|kf| kf.pose.translation).collect();
        let trajectory_length_m = centres.windows(2).map(|w| (w[1] - w[0]).norm()).sum();

        let bounds = map.map_points().fold(None, |acc: Option<BoundingBox>, mp| {
            let p = [mp.position.x, mp.position.y, mp.position.z];
            Some(match acc {
                None => BoundingBox { min: p, max: p },
                Some(mut b) => {
                    for k in 0..3 {
                        b.min[k] = b.min[k].min(p[k]);
                        b.max[k] = b.max[k].max(p[k]);
                    }
                    b
                }
            })
        });

        let camera = atlas.camera();
        Self {
            num_keyframes: map.num_keyframes(),
            num_landmarks: map.num_map_points(),
            num_loop_edges: map.num_loop_edges(),
            descriptor_len: atlas.descriptor_len(),
            image_width: camera.width,
            image_height: camera.height,
            trajectory_length_m,
            bounds,
            keyframes,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
