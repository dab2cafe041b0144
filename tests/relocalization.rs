//! Map a scene, persist it, and localize fresh images against the stored map.

mod common;

use image::RgbImage;
use nalgebra::Vector3;

use common::{camera, pose, test_config, Room};
use vislam::geometry::SE3;
use vislam::io;
use vislam::relocalization::{MapRegistry, Relocalizer};
use vislam::{start_session, Atlas, SlamConfig, SlamError};

fn room() -> Room {
    Room::new(Vector3::new(-2.0, -1.2, -2.0), Vector3::new(3.0, 1.2, 2.5))
}

fn walk_pose(k: usize) -> SE3 {
    pose(0.02 * k as f64, Vector3::new(0.025 * k as f64, 0.0, 0.0))
}

fn build_map(frames: usize) -> Atlas {
    let cam = camera();
    let room = room();
    let mut session = start_session(cam.clone(), test_config()).unwrap();
    for k in 0..frames {
        session.ingest(room.rgbd_frame(&cam, k, &walk_pose(k))).unwrap();
    }
    session.finish().unwrap()
}

fn registry() -> MapRegistry {
    let config = SlamConfig::default();
    let relocalizer = Relocalizer::new(config.relocalization, config.matcher, config.extractor).unwrap();
    MapRegistry::new(relocalizer)
}

#[test]
fn test_exported_map_survives_import() {
    let atlas = build_map(12);
    let bytes = io::export_map(&atlas).unwrap();
    let restored = io::import_map(&bytes).unwrap();

    assert_eq!(restored.num_keyframes(), atlas.num_keyframes());
    assert_eq!(restored.map().num_map_points(), atlas.map().num_map_points());
    assert_eq!(restored.descriptor_len(), atlas.descriptor_len());
    assert_eq!(restored.vocabulary().num_words(), atlas.vocabulary().num_words());
    for kf in atlas.map().keyframes() {
        let other = restored.map().get_keyframe(kf.id).unwrap();
        assert_eq!(other.timestamp_ns, kf.timestamp_ns);
        assert!(other.pose.distance_to(&kf.pose) < 1e-12);
        assert_eq!(other.map_point_ids, kf.map_point_ids);
    }
    restored.check_integrity().unwrap();

    // Corrupting the payload is caught, never half-loaded.
    let mut broken = bytes.clone();
    broken.truncate(bytes.len() / 2);
    assert!(matches!(io::import_map(&broken), Err(SlamError::MapFormat(_))));
}

#[test]
fn test_localize_near_mapped_keyframe() {
    let cam = camera();
    let atlas = io::import_map(&io::export_map(&build_map(16)).unwrap()).unwrap();
    let registry = registry();
    registry.insert("walk", atlas);

    let truth = pose(0.17, Vector3::new(0.21, 0.01, 0.02));
    let (image, _) = room().render(&cam, &truth);
    let loc = registry.localize("walk", &[image]).unwrap();

    assert!(loc.pose.distance_to(&truth) < 0.1, "{:?}", loc.pose);
    assert!(loc.pose.angle_to(&truth) < 3f64.to_radians());
    assert!(loc.confidence > 0.0 && loc.confidence <= 1.0);
    assert!(loc.num_inliers <= loc.num_matches);
}

#[test]
fn test_localize_fuses_consistent_images() {
    let cam = camera();
    let registry = registry();
    registry.insert("walk", build_map(16));

    let truth = pose(0.1, Vector3::new(0.12, 0.0, 0.0));
    let nudged = pose(0.1, Vector3::new(0.125, 0.0, 0.0));
    let images = vec![room().render(&cam, &truth).0, room().render(&cam, &nudged).0];
    let loc = registry.localize("walk", &images).unwrap();

    assert!(loc.image_index < images.len());
    assert!(loc.fused_images >= 1 && loc.fused_images <= images.len());
    assert!(loc.pose.distance_to(&truth) < 0.1);
    assert!(loc.confidence > 0.0 && loc.confidence <= 1.0);
}

#[test]
fn test_miscalibrated_image_is_skipped() {
    let cam = camera();
    let registry = registry();
    registry.insert("walk", build_map(8));

    // Intrinsics cannot be rescaled to an eighth of the calibrated size.
    let tiny = RgbImage::new(cam.width / 8, cam.height / 8);
    let good = room().render(&cam, &walk_pose(3)).0;
    let loc = registry.localize("walk", &[tiny.clone(), good]).unwrap();
    assert_eq!(loc.image_index, 1);
    assert_eq!(loc.fused_images, 1);

    assert!(matches!(registry.localize("walk", &[tiny]), Err(SlamError::Calibration(_))));
}

#[test]
fn test_query_size_is_validated() {
    let cam = camera();
    let registry = registry();
    registry.insert("walk", build_map(4));

    assert!(matches!(registry.localize("walk", &[]), Err(SlamError::InvalidQuery(_))));
    let image = room().render(&cam, &walk_pose(1)).0;
    let six = vec![image; 6];
    assert!(matches!(registry.localize("walk", &six), Err(SlamError::InvalidQuery(_))));
    assert!(matches!(
        registry.localize("missing", &six[..1]),
        Err(SlamError::UnknownMap(_))
    ));
}

#[test]
fn test_unrelated_scene_is_not_localized() {
    let cam = camera();
    let registry = registry();
    registry.insert("walk", build_map(8));

    // Walls at other coordinates carry unrelated texture.
    let other = Room::new(Vector3::new(-7.0, -1.2, -5.0), Vector3::new(-3.0, 1.2, -1.5));
    let image = other.render(&cam, &pose(0.0, Vector3::new(-5.0, 0.0, -4.0))).0;
    assert!(registry.localize("walk", &[image]).is_err());
}
