//! Inertial input: samples and gyro preintegration into a rotation prior.

pub mod preintegration;
pub mod sample;

pub use preintegration::{GyroPreintegrator, ImuConfig, RotationPrior};
pub use sample::{ImuBias, ImuSample};
