//! Visual(-inertial) SLAM core.
//!
//! A mapping session ([`system::SlamSession`]) consumes RGB(-D) frames with
//! optional inertial samples and builds an [`atlas::Atlas`]: keyframes,
//! landmarks, a pose graph corrected on loop closure, and a vocabulary for
//! place recognition. Finished maps are persisted with [`io::persistence`]
//! and serve cold-start relocalization queries through
//! [`relocalization::MapRegistry`].

pub mod atlas;
pub mod config;
pub mod error;
pub mod geometry;
pub mod imu;
pub mod io;
pub mod local_mapping;
pub mod loop_closing;
pub mod optimizer;
pub mod relocalization;
pub mod system;
pub mod tracking;
pub mod vocabulary;

pub use atlas::Atlas;
pub use config::{ProcessingMode, SlamConfig};
pub use error::{Result, SlamError};
pub use system::{start_session, SessionReport, SlamSession};
pub use tracking::frame::{CalibratedCamera, Frame};
