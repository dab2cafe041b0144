//! Relocalization: recover a pose from a few images without temporal
//! context, against a session's map or a registered finished one.

pub mod registry;
pub mod relocalizer;

pub use registry::MapRegistry;
pub use relocalizer::{
    confidence, locate, CandidateMatch, Localization, Orientation, PoseRecord, Position, RelocalizationConfig,
    Relocalizer,
};
