//! Stick normalization and direction classification

use std::f32::consts::PI;

use nalgebra::Vector2;
use serde::Serialize;

use crate::calibration::StickCalibration;

/// Physical analog stick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stick {
    Left,
    Right,
}

/// Eight-way stick direction plus rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum StickDirection {
    Up,
    UpRight,
    Right,
    DownRight,
    Down,
    DownLeft,
    Left,
    UpLeft,
    #[default]
    Neutral,
}

/// Squared normalized length below which the stick has no direction
pub const DIRECTION_THRESHOLD: f32 = 0.25;

/// Sector index to direction, starting at Down and turning clockwise
const SECTORS: [StickDirection; 8] = [
    StickDirection::Down,
    StickDirection::DownLeft,
    StickDirection::Left,
    StickDirection::UpLeft,
    StickDirection::Up,
    StickDirection::UpRight,
    StickDirection::Right,
    StickDirection::DownRight,
];

/// Result of processing one raw stick sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StickReading {
    pub raw: (u16, u16),
    /// Position after dead zone, roughly in [-1, 1]
    pub position: Vector2<f32>,
    pub direction: StickDirection,
}

/// Center and scale a raw sample
pub fn normalize(raw: (u16, u16), cal: &StickCalibration) -> Vector2<f32> {
    let axis = |value: u16, center: u16, neg: u16, pos: u16| {
        let centered = value as f32 - center as f32;
        let span = if centered >= 0.0 { pos } else { neg };
        if span == 0 {
            0.0
        } else {
            centered / span as f32
        }
    };
    Vector2::new(
        axis(raw.0, cal.x.center, cal.x.min_neg_delta, cal.x.max_pos_delta),
        axis(raw.1, cal.y.center, cal.y.min_neg_delta, cal.y.max_pos_delta),
    )
}

/// Whether a normalized position lies inside the circular dead zone
///
/// A length of exactly `deadzone / max_pos_delta` counts as inside.
pub fn in_deadzone(position: &Vector2<f32>, calibration: &StickCalibration) -> bool {
    if calibration.x.max_pos_delta == 0 {
        return false;
    }
    let radius = calibration.deadzone / calibration.x.max_pos_delta as f32;
    position.norm_squared() <= radius * radius
}

pub fn classify(position: &Vector2<f32>) -> StickDirection {
    if position.norm_squared() < DIRECTION_THRESHOLD {
        return StickDirection::Neutral;
    }
    let sector = (4.0 * position.x.atan2(position.y) / PI + 4.5).floor() as i32;
    SECTORS[sector.rem_euclid(8) as usize]
}

/// Normalize, apply the dead zone and classify a raw sample
///
/// Classification uses the normalized vector before the dead zone, so a
/// sample can be zeroed yet still carry a direction when the dead zone is
/// wider than the direction threshold.
pub fn process(raw: (u16, u16), cal: &StickCalibration) -> StickReading {
    let normalized = normalize(raw, cal);
    let direction = classify(&normalized);
    let position = if in_deadzone(&normalized, cal) {
        Vector2::zeros()
    } else {
        normalized
    };
    StickReading {
        raw,
        position,
        direction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::AxisCalibration;

    fn calibration(deadzone: f32) -> StickCalibration {
        let axis = AxisCalibration {
            min_neg_delta: 1000,
            center: 2000,
            max_pos_delta: 1000,
        };
        StickCalibration {
            x: axis,
            y: axis,
            deadzone,
            range_ratio: 0.0,
        }
    }

    #[test]
    fn test_normalize_uses_side_specific_span() {
        let mut cal = calibration(0.0);
        cal.x.min_neg_delta = 500;
        let v = normalize((1500, 3000), &cal);
        assert_eq!(v, Vector2::new(-1.0, 1.0));
        let v = normalize((2500, 2000), &cal);
        assert_eq!(v, Vector2::new(0.5, 0.0));
    }

    #[test]
    fn test_deadzone_boundary_is_inside() {
        let cal = calibration(100.0);
        let at_edge = process((2100, 2000), &cal);
        assert_eq!(at_edge.position, Vector2::zeros());

        let past_edge = process((2101, 2000), &cal);
        assert!((past_edge.position.x - 0.101).abs() < 1e-6);
    }

    #[test]
    fn test_cardinal_directions() {
        assert_eq!(classify(&Vector2::new(0.0, 1.0)), StickDirection::Up);
        assert_eq!(classify(&Vector2::new(1.0, 0.0)), StickDirection::Right);
        assert_eq!(classify(&Vector2::new(0.0, -1.0)), StickDirection::Down);
        assert_eq!(classify(&Vector2::new(-1.0, 0.0)), StickDirection::Left);
        assert_eq!(classify(&Vector2::new(0.7, 0.7)), StickDirection::UpRight);
        assert_eq!(classify(&Vector2::new(-0.7, -0.7)), StickDirection::DownLeft);
    }

    #[test]
    fn test_direction_threshold() {
        // 0.5^2 == 0.25 exactly
        assert_eq!(classify(&Vector2::new(0.0, 0.5)), StickDirection::Up);
        assert_eq!(classify(&Vector2::new(0.0, 0.49)), StickDirection::Neutral);
        assert_eq!(classify(&Vector2::new(0.3, 0.3)), StickDirection::Neutral);
    }

    #[test]
    fn test_direction_ignores_deadzone() {
        let cal = calibration(800.0);
        let reading = process((2000, 2600), &cal);
        assert_eq!(reading.position, Vector2::zeros());
        assert_eq!(reading.direction, StickDirection::Up);
    }
}
