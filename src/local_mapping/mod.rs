//! Local Mapping thread.
//!
//! The Local Mapping thread is responsible for:
//! - Inserting new keyframes into the map and the vocabulary
//! - Creating landmarks from depth and from two-view triangulation
//! - Fusing duplicate observations and refining landmark positions
//! - Culling weak landmarks and redundant keyframes
//! - Running the incremental pose graph and feeding Loop Closing

pub mod local_mapper;
pub mod refinement;
pub mod triangulation;

pub use local_mapper::{LocalMapper, MappingConfig};
pub use refinement::{fuse_observation, RefinementConfig};
pub use triangulation::{back_project_depth, triangulate, LevelScale, TriangulationConfig, TriangulationOutcome};
