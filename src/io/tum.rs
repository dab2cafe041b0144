//! TUM RGB-D dataset reader.
//!
//! Layout:
//! ```text
//! <root>/rgb.txt     timestamp filename      (colour images)
//! <root>/depth.txt   timestamp filename      (16-bit depth PNGs, optional)
//! <root>/imu.txt     timestamp gx gy gz ax ay az   (optional)
//! ```
//! Timestamps are in seconds. Every colour image is paired with the depth
//! image closest in time, if one is within `max_depth_offset_ns`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, StringRecord};
use image::{ImageBuffer, Luma};
use nalgebra::Vector3;
use tracing::{info, warn};

use crate::imu::ImuSample;
use crate::tracking::frame::{DepthImage, Frame};

/// TUM depth PNGs store 5000 units per metre.
pub const TUM_DEPTH_UNITS_PER_M: f64 = 5000.0;

/// Largest colour/depth timestamp difference accepted as a pair (20 ms).
const DEFAULT_MAX_DEPTH_OFFSET_NS: u64 = 20_000_000;

#[derive(Debug, Clone)]
pub struct FrameEntry {
    pub timestamp_ns: u64,
    pub rgb: PathBuf,
    pub depth: Option<PathBuf>,
}

#[derive(Debug)]
pub struct TumDataset {
    root: PathBuf,
    pub frames: Vec<FrameEntry>,
    pub imu: Vec<ImuSample>,
    /// Raw depth units per metre.
    pub depth_units_per_m: f64,
}

impl TumDataset {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open_with(root, TUM_DEPTH_UNITS_PER_M, DEFAULT_MAX_DEPTH_OFFSET_NS)
    }

    pub fn open_with<P: AsRef<Path>>(root: P, depth_units_per_m: f64, max_depth_offset_ns: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if depth_units_per_m <= 0.0 {
            bail!("depth scale must be positive, got {}", depth_units_per_m);
        }
        let rgb = load_image_list(&root.join("rgb.txt"))?;
        if rgb.is_empty() {
            bail!("no colour images listed in {}", root.join("rgb.txt").display());
        }

        let depth_list = root.join("depth.txt");
        let depth = if depth_list.exists() {
            load_image_list(&depth_list)?
        } else {
            warn!("[Dataset] no depth.txt, running monocular");
            Vec::new()
        };

        let imu_list = root.join("imu.txt");
        let imu = if imu_list.exists() { load_imu_list(&imu_list)? } else { Vec::new() };

        let frames: Vec<FrameEntry> = rgb
            .into_iter()
            .map(|(ts, file)| FrameEntry {
                timestamp_ns: ts,
                rgb: root.join(file),
                depth: nearest(&depth, ts, max_depth_offset_ns).map(|f| root.join(f)),
            })
            .collect();

        info!(
            "[Dataset] {}: {} frames ({} with depth), {} IMU samples",
            root.display(),
            frames.len(),
            frames.iter().filter(|f| f.depth.is_some()).count(),
            imu.len()
        );
        Ok(Self {
            root,
            frames,
            imu,
            depth_units_per_m,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// IMU samples in `(after_ns, until_ns]`.
    pub fn imu_between(&self, after_ns: u64, until_ns: u64) -> Vec<ImuSample> {
        let start = self.imu.partition_point(|s| s.timestamp_ns <= after_ns);
        let end = self.imu.partition_point(|s| s.timestamp_ns <= until_ns);
        self.imu[start..end.max(start)].to_vec()
    }

    /// Load frame `idx` with its depth and the IMU samples since frame `idx - 1`.
    pub fn frame(&self, idx: usize) -> Result<Frame> {
        let entry = self
            .frames
            .get(idx)
            .with_context(|| format!("no frame at index {}", idx))?;
        let color = image::open(&entry.rgb)
            .with_context(|| format!("failed to read {}", entry.rgb.display()))?
            .to_rgb8();
        let mut frame = Frame::new(entry.timestamp_ns, color);

        if let Some(path) = &entry.depth {
            let raw = image::open(path)
                .with_context(|| format!("failed to read {}", path.display()))?
                .to_luma16();
            frame = frame.with_depth(to_millimetres(&raw, self.depth_units_per_m));
        }

        let prev_ns = idx
            .checked_sub(1)
            .and_then(|p| self.frames.get(p))
            .map_or(entry.timestamp_ns.saturating_sub(1), |p| p.timestamp_ns);
        let imu = self.imu_between(prev_ns, entry.timestamp_ns);
        if !imu.is_empty() {
            frame = frame.with_imu(imu);
        }
        Ok(frame)
    }
}

fn to_millimetres(raw: &ImageBuffer<Luma<u16>, Vec<u16>>, units_per_m: f64) -> DepthImage {
    let scale = 1000.0 / units_per_m;
    DepthImage::from_fn(raw.width(), raw.height(), |x, y| {
        let mm = (raw.get_pixel(x, y).0[0] as f64 * scale).round();
        Luma([mm.min(u16::MAX as f64) as u16])
    })
}

/// Entry of `list` closest to `ts`, if within `max_offset_ns`. `list` is sorted.
fn nearest(list: &[(u64, String)], ts: u64, max_offset_ns: u64) -> Option<&str> {
    let i = list.partition_point(|(t, _)| *t < ts);
    [i.checked_sub(1), Some(i)]
        .into_iter()
        .flatten()
        .filter_map(|k| list.get(k))
        .min_by_key(|(t, _)| t.abs_diff(ts))
        .filter(|(t, _)| t.abs_diff(ts) <= max_offset_ns)
        .map(|(_, f)| f.as_str())
}

/// Seconds with a decimal fraction to nanoseconds, without going through f64.
pub fn parse_timestamp_ns(s: &str) -> Result<u64> {
    let s = s.trim();
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs: u64 = secs.parse().with_context(|| format!("bad timestamp {:?}", s))?;
    if frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
        bail!("bad timestamp {:?}", s);
    }
    let frac_ns: u64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<9}", frac).parse()?
    };
    Ok(secs * 1_000_000_000 + frac_ns)
}

fn records(path: &Path) -> Result<Vec<StringRecord>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        // Repeated separators show up as empty fields.
        let fields: StringRecord = rec.iter().filter(|f| !f.is_empty()).collect();
        if !fields.is_empty() {
            out.push(fields);
        }
    }
    Ok(out)
}

fn load_image_list(path: &Path) -> Result<Vec<(u64, String)>> {
    let mut entries = Vec::new();
    for rec in records(path)? {
        if rec.len() < 2 {
            continue;
        }
        entries.push((parse_timestamp_ns(&rec[0])?, rec[1].to_string()));
    }
    entries.sort_by_key(|(t, _)| *t);
    Ok(entries)
}

fn load_imu_list(path: &Path) -> Result<Vec<ImuSample>> {
    let mut samples = Vec::new();
    for rec in records(path)? {
        if rec.len() < 7 {
            continue;
        }
        let v = |k: usize| -> Result<f64> {
            rec[k]
                .parse()
                .with_context(|| format!("bad IMU value {:?} in {}", &rec[k], path.display()))
        };
        samples.push(ImuSample::new(
            parse_timestamp_ns(&rec[0])?,
            Vector3::new(v(1)?, v(2)?, v(3)?),
            Vector3::new(v(4)?, v(5)?, v(6)?),
        ));
    }
    samples.sort_by_key(|s| s.timestamp_ns);
    Ok(samples)
}
