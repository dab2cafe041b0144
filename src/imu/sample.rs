use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Single IMU measurement in the sensor body frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// Same clock as the frame timestamps.
    pub timestamp_ns: u64,
    /// Angular velocity, rad/s.
    pub gyro: Vector3<f64>,
    /// Specific force, m/s^2.
    pub accel: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_ns: u64, gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self {
            timestamp_ns,
            gyro,
            accel,
        }
    }
}

/// IMU biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}
