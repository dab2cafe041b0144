//! Persistence, exports and dataset input.

pub mod dense_cloud;
pub mod persistence;
pub mod trajectory;
pub mod tum;

pub use dense_cloud::{export_dense_cloud, export_dense_cloud_with, write_ply, CloudPoint};
pub use persistence::{export_map, export_map_file, import_map, import_map_file};
pub use trajectory::{write_tum, write_tum_trajectory, write_tum_trajectory_file, MapSummary};
pub use tum::TumDataset;
