//! Session orchestration and thread management.
//!
//! This module contains the `SlamSession` that spawns and coordinates the
//! Tracking, Local Mapping, Loop Closing and pose-graph threads, along with
//! shared state, frame reordering and inter-thread messaging types.

pub mod frame_buffer;
pub mod messages;
pub mod shared_state;
mod slam_system;

pub use frame_buffer::{Admission, ReorderBuffer};
pub use messages::NewKeyFrameMsg;
pub use shared_state::{SessionStats, SharedState, StatsSnapshot};
pub use slam_system::{start_session, Ingested, SessionReport, SlamSession};
