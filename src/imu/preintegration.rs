use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};

use super::sample::{ImuBias, ImuSample};

/// Inertial parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Use inertial samples as a rotation prior when present.
    /// Default: true
    pub enabled: bool,

    /// Largest gap between consecutive samples (or between the last sample
    /// and a frame boundary) that still yields a usable prior, seconds.
    /// Default: 0.05
    pub max_gap_s: f64,

    /// Rotation from the IMU body frame to the camera frame, as [w, x, y, z].
    /// Default: identity
    pub rotation_cam_imu: [f64; 4],

    /// Gyroscope bias, rad/s.
    /// Default: zero
    pub bias: ImuBias,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_gap_s: 0.05,
            rotation_cam_imu: [1.0, 0.0, 0.0, 0.0],
            bias: ImuBias::zero(),
        }
    }
}

impl ImuConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_gap_s > 0.0) {
            return Err(SlamError::Config(format!(
                "imu.max_gap_s must be positive, got {}",
                self.max_gap_s
            )));
        }
        let [w, x, y, z] = self.rotation_cam_imu;
        let norm = (w * w + x * x + y * y + z * z).sqrt();
        if !(norm > 1e-6) {
            return Err(SlamError::Config("imu.rotation_cam_imu must be non-zero".into()));
        }
        Ok(())
    }

    pub fn cam_from_imu(&self) -> UnitQuaternion<f64> {
        let [w, x, y, z] = self.rotation_cam_imu;
        UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(w, x, y, z))
    }
}

/// Relative camera rotation between two frames, from integrated gyro.
#[derive(Debug, Clone, Copy)]
pub struct RotationPrior {
    /// Rotation of the current camera relative to the previous one
    /// (R_prev_curr, camera frame).
    pub delta: UnitQuaternion<f64>,
    /// Integrated time span, seconds.
    pub dt: f64,
}

/// Gyro preintegrator.
///
/// Only the rotation is integrated: without visual-inertial initialisation
/// the accelerometer cannot be trusted for translation, and a bad prior is
/// worse than the constant-velocity model it replaces.
pub struct GyroPreintegrator {
    bias: Vector3<f64>,
    cam_from_imu: UnitQuaternion<f64>,
    max_gap_ns: u64,
}

impl GyroPreintegrator {
    pub fn new(config: &ImuConfig) -> Self {
        Self {
            bias: config.bias.gyro,
            cam_from_imu: config.cam_from_imu(),
            max_gap_ns: (config.max_gap_s * 1e9) as u64,
        }
    }

    /// Integrate the samples between two frame timestamps.
    ///
    /// Returns `None` when coverage is incomplete: no samples, unordered
    /// samples, or a gap longer than the configured maximum anywhere in
    /// `[prev_ns, curr_ns]`. Tracking then falls back to its motion model.
    pub fn integrate(&self, samples: &[ImuSample], prev_ns: u64, curr_ns: u64) -> Option<RotationPrior> {
        if curr_ns <= prev_ns || samples.is_empty() {
            return None;
        }
        let first = samples.first()?;
        let last = samples.last()?;
        if first.timestamp_ns.saturating_sub(prev_ns) > self.max_gap_ns {
            return None;
        }
        if curr_ns.saturating_sub(last.timestamp_ns) > self.max_gap_ns {
            return None;
        }

        let mut delta_imu = UnitQuaternion::identity();
        let mut integrated = 0.0;
        // Hold the first rate back to the previous frame.
        let head_end = first.timestamp_ns.min(curr_ns);
        if head_end > prev_ns {
            let dt = (head_end - prev_ns) as f64 * 1e-9;
            delta_imu *= UnitQuaternion::from_scaled_axis((first.gyro - self.bias) * dt);
            integrated += dt;
        }
        for pair in samples.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.timestamp_ns < a.timestamp_ns {
                return None;
            }
            let gap = b.timestamp_ns - a.timestamp_ns;
            if gap > self.max_gap_ns {
                return None;
            }
            // Clip the interval to the frame bracket.
            let start = a.timestamp_ns.max(prev_ns);
            let end = b.timestamp_ns.min(curr_ns);
            if end <= start {
                continue;
            }
            let dt = (end - start) as f64 * 1e-9;
            let omega = 0.5 * (a.gyro + b.gyro) - self.bias;
            delta_imu *= UnitQuaternion::from_scaled_axis(omega * dt);
            integrated += dt;
        }
        // Hold the last rate until the frame if the samples stop short of it.
        if last.timestamp_ns < curr_ns {
            let dt = (curr_ns - last.timestamp_ns.max(prev_ns)) as f64 * 1e-9;
            delta_imu *= UnitQuaternion::from_scaled_axis((last.gyro - self.bias) * dt);
            integrated += dt;
        }
        if integrated <= 0.0 {
            return None;
        }

        let delta = self.cam_from_imu * delta_imu * self.cam_from_imu.inverse();
        Some(RotationPrior {
            delta,
            dt: integrated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn samples(rate_hz: u64, from_ns: u64, to_ns: u64, gyro: Vector3<f64>) -> Vec<ImuSample> {
        let step = 1_000_000_000 / rate_hz;
        (0..)
            .map(|i| from_ns + i * step)
            .take_while(|&t| t <= to_ns)
            .map(|t| ImuSample::new(t, gyro, Vector3::new(0.0, 0.0, 9.81)))
            .collect()
    }

    #[test]
    fn test_constant_rate_integrates_to_angle() {
        let pre = GyroPreintegrator::new(&ImuConfig::default());
        let gyro = Vector3::new(0.0, 0.5, 0.0);
        let s = samples(200, 0, 100_000_000, gyro);
        let prior = pre.integrate(&s, 0, 100_000_000).unwrap();
        assert_relative_eq!(prior.delta.angle(), 0.05, epsilon = 1e-9);
        assert_relative_eq!(prior.dt, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_samples_starting_after_previous_frame_cover_full_interval() {
        let pre = GyroPreintegrator::new(&ImuConfig::default());
        let gyro = Vector3::new(0.0, 3.0, 0.0);
        // First sample 5 ms after the previous frame, last one on the frame.
        let s = samples(200, 5_000_000, 33_333_333, gyro);
        let prior = pre.integrate(&s, 0, 33_333_333).unwrap();
        assert_relative_eq!(prior.dt, 0.033_333_333, epsilon = 1e-9);
        assert_relative_eq!(prior.delta.angle(), 3.0 * 0.033_333_333, epsilon = 1e-9);
    }

    #[test]
    fn test_gap_invalidates_prior() {
        let pre = GyroPreintegrator::new(&ImuConfig::default());
        let mut s = samples(200, 0, 20_000_000, Vector3::zeros());
        s.extend(samples(200, 90_000_000, 100_000_000, Vector3::zeros()));
        assert!(pre.integrate(&s, 0, 100_000_000).is_none());
        assert!(pre.integrate(&[], 0, 100_000_000).is_none());
    }

    #[test]
    fn test_extrinsic_rotates_axis() {
        let mut config = ImuConfig::default();
        // 90 degrees about z: IMU x axis becomes camera y axis.
        let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        config.rotation_cam_imu = [q.w, q.i, q.j, q.k];
        let pre = GyroPreintegrator::new(&config);
        let s = samples(200, 0, 100_000_000, Vector3::new(1.0, 0.0, 0.0));
        let prior = pre.integrate(&s, 0, 100_000_000).unwrap();
        let axis = prior.delta.axis().unwrap();
        assert_relative_eq!(axis.into_inner(), Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-9);
    }
}
