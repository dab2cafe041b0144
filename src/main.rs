use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use tracing::warn;

use vislam::config::ProcessingMode;
use vislam::io::{self, MapSummary, TumDataset};
use vislam::relocalization::{MapRegistry, Relocalizer};
use vislam::{start_session, CalibratedCamera, SlamConfig};

const USAGE: &str = "usage:
  vislam map <dataset> <camera.json> <out.map> [config.json]
  vislam localize <map> <image>...
  vislam export <map> <cloud.ply> <trajectory.txt>";

/// Points written by `export`.
const MAX_CLOUD_POINTS: usize = 2_000_000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("vislam=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("map") if args.len() == 4 || args.len() == 5 => {
            map(&args[1], &args[2], &args[3], args.get(4).map(String::as_str))
        }
        Some("localize") if args.len() >= 3 => localize(&args[1], &args[2..]),
        Some("export") if args.len() == 4 => export(&args[1], &args[2], &args[3]),
        _ => bail!("{}", USAGE),
    }
}

fn map(dataset: &str, camera: &str, out: &str, config: Option<&str>) -> Result<()> {
    let camera: CalibratedCamera = serde_json::from_str(
        &std::fs::read_to_string(camera).with_context(|| format!("failed to read {}", camera))?,
    )
    .with_context(|| format!("bad camera file {}", camera))?;
    let mut config = match config {
        Some(path) => SlamConfig::from_json_file(path)?,
        None => SlamConfig::default(),
    };
    // Recorded data: never drop frames.
    config.system.mode = ProcessingMode::Offline;

    let dataset = TumDataset::open(dataset)?;
    let mut session = start_session(camera, config)?;
    for i in 0..dataset.len() {
        let frame = dataset.frame(i)?;
        match session.ingest(frame) {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!("frame {}: {}", i, e),
        }
        if i % 100 == 0 {
            println!("Frame {}/{}: state={:?}", i, dataset.len(), session.tracking_state());
        }
    }

    let report = session.finish_with_report()?;
    io::export_map_file(&report.atlas, out)?;
    println!(
        "Done! {} frames tracked, {} keyframes, {} loops, {} lost transitions",
        report.frames_tracked,
        report.atlas.num_keyframes(),
        report.loops.len(),
        report.lost_transitions
    );
    println!("{}", serde_json::to_string_pretty(&report.stats)?);
    Ok(())
}

fn localize(map: &str, images: &[String]) -> Result<()> {
    let images: Vec<RgbImage> = images
        .iter()
        .map(|p| {
            image::open(p)
                .with_context(|| format!("failed to read {}", p))
                .map(|img| img.to_rgb8())
        })
        .collect::<Result<_>>()?;

    let config = SlamConfig::default();
    let relocalizer = Relocalizer::new(config.relocalization, config.matcher, config.extractor)?;
    let registry = MapRegistry::new(relocalizer);
    let map_id = Path::new(map)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("map")
        .to_string();
    registry.load_file(map_id.clone(), map)?;

    let loc = registry.localize(&map_id, &images)?;
    let out = serde_json::json!({
        "pose": loc.pose_record(),
        "confidence": loc.confidence,
        "inliers": loc.num_inliers,
        "matches": loc.num_matches,
        "keyframe": loc.matched_keyframe.0,
        "image": loc.image_index,
        "fused_images": loc.fused_images,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn export(map: &str, cloud: &str, trajectory: &str) -> Result<()> {
    let atlas = io::import_map_file(map)?;
    let points = io::export_dense_cloud(&atlas, MAX_CLOUD_POINTS);
    io::write_ply(&points, cloud)?;
    io::write_tum_trajectory_file(&atlas, trajectory)?;
    println!("{}", MapSummary::from_atlas(&atlas).to_json()?);
    Ok(())
}
