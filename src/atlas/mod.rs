//! Atlas module - SLAM map data structures.
//!
//! - [`map`] - KeyFrames, MapPoints, pose-graph edges and the [`Map`] container
//! - [`Atlas`] - Map plus vocabulary and calibration, the unit that is
//!   persisted and relocalized against

pub mod atlas;
pub mod map;

pub use atlas::Atlas;
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
