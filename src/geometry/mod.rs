//! Geometry utilities: rigid and similarity transforms, two-view geometry,
//! PnP solving.

pub mod pnp;
pub mod se3;
pub mod sim3;
pub mod so3;
pub mod two_view;

pub use pnp::{refine_pose, refine_pose_weighted, solve_pnp_ransac, PnpParams, PnpResult};
pub use se3::SE3;
pub use sim3::Sim3;
pub use two_view::{estimate_relative_pose, parallax_deg, triangulate_dlt, TwoViewModel, TwoViewParams, TwoViewResult};
