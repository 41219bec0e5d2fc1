//! Accelerometer / gyroscope conversion

use nalgebra::Vector3;
use serde::Serialize;

use crate::calibration::SensorCalibration;
use crate::protocol::SensorFrame;

/// g per count when no accelerometer calibration is available
pub const ACCEL_FALLBACK_SCALE: f32 = 0.000244;
/// Degrees per second per count when no gyroscope calibration is available
pub const GYRO_FALLBACK_SCALE: f32 = 0.06103;

/// One converted 6-axis sample
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MotionSample {
    /// Acceleration in g
    pub accel: Vector3<f32>,
    /// Angular rate in degrees per second
    pub gyro: Vector3<f32>,
}

fn apply(raw: [i16; 3], calibration: &SensorCalibration) -> Vector3<f32> {
    Vector3::from_fn(|axis, _| (raw[axis] as f32 - calibration.offset[axis]) * calibration.coeff[axis])
}

fn scale(raw: [i16; 3], factor: f32) -> Vector3<f32> {
    Vector3::from_fn(|axis, _| raw[axis] as f32 * factor)
}

pub fn convert(
    frame: &SensorFrame,
    accel: Option<&SensorCalibration>,
    gyro: Option<&SensorCalibration>,
) -> MotionSample {
    let accel = match accel {
        Some(cal) => {
            let mut v = apply(frame.accel, cal);
            // resting gravity
            v.z += 1.0;
            v
        }
        None => scale(frame.accel, ACCEL_FALLBACK_SCALE),
    };
    let gyro = match gyro {
        Some(cal) => apply(frame.gyro, cal),
        None => scale(frame.gyro, GYRO_FALLBACK_SCALE),
    };
    MotionSample { accel, gyro }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_constants() {
        let frame = SensorFrame {
            accel: [4096, -4096, 0],
            gyro: [100, 0, -100],
        };
        let sample = convert(&frame, None, None);
        assert!((sample.accel.x - 4096.0 * 0.000244).abs() < 1e-6);
        assert!((sample.accel.y + 4096.0 * 0.000244).abs() < 1e-6);
        assert_eq!(sample.accel.z, 0.0);
        assert!((sample.gyro.x - 6.103).abs() < 1e-4);
        assert!((sample.gyro.z + 6.103).abs() < 1e-4);
    }

    #[test]
    fn test_calibrated_conversion() {
        let accel = SensorCalibration {
            offset: [10.0, 0.0, 0.0],
            coeff: [0.5, 0.5, 0.5],
        };
        let gyro = SensorCalibration {
            offset: [1.0, 2.0, 3.0],
            coeff: [2.0, 2.0, 2.0],
        };
        let frame = SensorFrame {
            accel: [20, 4, -2],
            gyro: [1, 3, 5],
        };
        let sample = convert(&frame, Some(&accel), Some(&gyro));
        assert_eq!(sample.accel, Vector3::new(5.0, 2.0, 0.0));
        assert_eq!(sample.gyro, Vector3::new(0.0, 2.0, 4.0));
    }
}
