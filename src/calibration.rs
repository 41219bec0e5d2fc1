//! Factory and user calibration read from SPI flash
//!
//! Calibration is loaded once per connection. A user slot overrides the
//! factory slot only when its magic tag is present; sensor coefficients that
//! would divide by zero are discarded so lookups fall back to the next source.

use tracing::{debug, trace};

use crate::stick::Stick;

/// Flash addresses and lengths of the calibration blocks
pub const LEFT_STICK_FACTORY_ADDRESS: u32 = 0x603D;
pub const RIGHT_STICK_FACTORY_ADDRESS: u32 = 0x6046;
pub const STICK_FACTORY_LEN: u8 = 9;
pub const LEFT_STICK_PARAMETERS_ADDRESS: u32 = 0x6086;
pub const RIGHT_STICK_PARAMETERS_ADDRESS: u32 = 0x6098;
pub const STICK_PARAMETERS_LEN: u8 = 18;
pub const LEFT_STICK_USER_ADDRESS: u32 = 0x8010;
pub const RIGHT_STICK_USER_ADDRESS: u32 = 0x801B;
pub const STICK_USER_LEN: u8 = 11;
pub const IMU_FACTORY_ADDRESS: u32 = 0x6020;
pub const IMU_FACTORY_LEN: u8 = 24;
pub const ACCEL_OFFSET_ADDRESS: u32 = 0x6080;
pub const ACCEL_OFFSET_LEN: u8 = 6;
pub const IMU_USER_ADDRESS: u32 = 0x8026;
pub const IMU_USER_LEN: u8 = 26;

/// Leading bytes of a populated user calibration slot
pub const USER_CALIBRATION_MAGIC: [u8; 2] = [0xB2, 0xA1];

/// Full-scale accelerometer range in g
pub const ACCEL_RANGE_G: f32 = 4.0;
/// Full-scale gyroscope range in degrees per second
pub const GYRO_RANGE_DPS: f32 = 936.0;

/// One stick axis: travel below and above center, in raw counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisCalibration {
    pub min_neg_delta: u16,
    pub center: u16,
    pub max_pos_delta: u16,
}

/// Both axes of a stick as stored in flash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StickAxes {
    pub x: AxisCalibration,
    pub y: AxisCalibration,
}

impl StickAxes {
    /// Decode a 9-byte stick blob using the layout of `stick`
    ///
    /// The blob packs six 12-bit values; the left and right sticks store
    /// them in different orders.
    pub fn decode(stick: Stick, bytes: &[u8]) -> Option<Self> {
        let v = unpack_nibble_values(bytes)?;
        let axes = match stick {
            Stick::Left => StickAxes {
                x: AxisCalibration { max_pos_delta: v[0], center: v[2], min_neg_delta: v[4] },
                y: AxisCalibration { max_pos_delta: v[1], center: v[3], min_neg_delta: v[5] },
            },
            Stick::Right => StickAxes {
                x: AxisCalibration { center: v[0], min_neg_delta: v[2], max_pos_delta: v[4] },
                y: AxisCalibration { center: v[1], min_neg_delta: v[3], max_pos_delta: v[5] },
            },
        };
        Some(axes)
    }
}

fn unpack_nibble_values(bytes: &[u8]) -> Option<[u16; 6]> {
    let bytes = bytes.get(..9)?;
    let mut values = [0u16; 6];
    for (i, chunk) in bytes.chunks(3).enumerate() {
        let (b0, b1, b2) = (chunk[0] as u16, chunk[1] as u16, chunk[2] as u16);
        values[i * 2] = ((b1 << 8) & 0xF00) | b0;
        values[i * 2 + 1] = (b2 << 4) | (b1 >> 4);
    }
    Some(values)
}

/// Dead zone and range ratio from the stick parameter block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StickParameters {
    pub deadzone: u16,
    pub range_ratio: u16,
}

impl StickParameters {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        Some(Self {
            deadzone: bytes[3] as u16,
            range_ratio: bytes[4] as u16 + ((bytes[5] as u16 & 0xF0) << 4),
        })
    }
}

/// Effective calibration of one stick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StickCalibration {
    pub x: AxisCalibration,
    pub y: AxisCalibration,
    pub deadzone: f32,
    pub range_ratio: f32,
}

/// Raw 6-axis calibration block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImuBlock {
    pub accel_origin: [i16; 3],
    pub accel_sensitivity: [i16; 3],
    pub gyro_offset: [i16; 3],
    pub gyro_sensitivity: [i16; 3],
}

impl ImuBlock {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < IMU_FACTORY_LEN as usize {
            return None;
        }
        let triple = |start: usize| read_i16_triple(&bytes[start..start + 6]);
        Some(Self {
            accel_origin: triple(0),
            accel_sensitivity: triple(6),
            gyro_offset: triple(12),
            gyro_sensitivity: triple(18),
        })
    }
}

fn read_i16_triple(bytes: &[u8]) -> [i16; 3] {
    [
        i16::from_le_bytes([bytes[0], bytes[1]]),
        i16::from_le_bytes([bytes[2], bytes[3]]),
        i16::from_le_bytes([bytes[4], bytes[5]]),
    ]
}

/// Per-axis linear conversion `(raw - offset) * coeff`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorCalibration {
    pub offset: [f32; 3],
    pub coeff: [f32; 3],
}

impl SensorCalibration {
    /// `None` when any axis has `sensitivity == origin`
    pub fn derive(scale: f32, origin: [i16; 3], sensitivity: [i16; 3], offset: [i16; 3]) -> Option<Self> {
        let mut coeff = [0f32; 3];
        for axis in 0..3 {
            let span = sensitivity[axis] as f32 - origin[axis] as f32;
            if span == 0.0 {
                return None;
            }
            coeff[axis] = scale / span;
        }
        Some(Self {
            offset: offset.map(|v| v as f32),
            coeff,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct StickSlots {
    factory: Option<StickAxes>,
    user: Option<StickAxes>,
    parameters: StickParameters,
}

/// Calibration loaded from one controller
#[derive(Debug, Clone, Default)]
pub struct CalibrationStore {
    left: StickSlots,
    right: StickSlots,
    imu_factory: Option<ImuBlock>,
    imu_user: Option<ImuBlock>,
    accel_offset: [i16; 3],
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots_mut(&mut self, stick: Stick) -> &mut StickSlots {
        match stick {
            Stick::Left => &mut self.left,
            Stick::Right => &mut self.right,
        }
    }

    fn slots(&self, stick: Stick) -> &StickSlots {
        match stick {
            Stick::Left => &self.left,
            Stick::Right => &self.right,
        }
    }

    pub fn load_stick_factory(&mut self, stick: Stick, bytes: &[u8]) {
        let slots = self.slots_mut(stick);
        if slots.factory.is_some() {
            return;
        }
        slots.factory = StickAxes::decode(stick, bytes);
        debug!("{:?} stick factory calibration: {:?}", stick, slots.factory);
    }

    pub fn load_stick_parameters(&mut self, stick: Stick, bytes: &[u8]) {
        if let Some(parameters) = StickParameters::decode(bytes) {
            trace!("{:?} stick parameters: {:?}", stick, parameters);
            self.slots_mut(stick).parameters = parameters;
        }
    }

    /// Returns whether a signed user calibration was found
    pub fn load_stick_user(&mut self, stick: Stick, bytes: &[u8]) -> bool {
        if bytes.get(..2) != Some(&USER_CALIBRATION_MAGIC[..]) {
            debug!("No user calibration for {:?} stick", stick);
            return false;
        }
        let slots = self.slots_mut(stick);
        if slots.user.is_none() {
            slots.user = StickAxes::decode(stick, &bytes[2..]);
        }
        slots.user.is_some()
    }

    pub fn load_imu_factory(&mut self, bytes: &[u8]) {
        if self.imu_factory.is_none() {
            self.imu_factory = ImuBlock::decode(bytes);
            debug!("IMU factory calibration: {:?}", self.imu_factory);
        }
    }

    pub fn load_accel_offset(&mut self, bytes: &[u8]) {
        if bytes.len() >= ACCEL_OFFSET_LEN as usize {
            self.accel_offset = read_i16_triple(bytes);
        }
    }

    /// Returns whether a signed user calibration was found
    pub fn load_imu_user(&mut self, bytes: &[u8]) -> bool {
        if bytes.get(..2) != Some(&USER_CALIBRATION_MAGIC[..]) {
            debug!("No user IMU calibration");
            return false;
        }
        if self.imu_user.is_none() {
            self.imu_user = ImuBlock::decode(&bytes[2..]);
        }
        self.imu_user.is_some()
    }

    /// User calibration if present, otherwise factory
    pub fn stick(&self, stick: Stick) -> Option<StickCalibration> {
        let slots = self.slots(stick);
        let axes = slots.user.or(slots.factory)?;
        Some(StickCalibration {
            x: axes.x,
            y: axes.y,
            deadzone: slots.parameters.deadzone as f32,
            range_ratio: slots.parameters.range_ratio as f32,
        })
    }

    fn accel_from(&self, block: &ImuBlock) -> Option<SensorCalibration> {
        SensorCalibration::derive(
            ACCEL_RANGE_G,
            block.accel_origin,
            block.accel_sensitivity,
            self.accel_offset,
        )
    }

    fn gyro_from(block: &ImuBlock) -> Option<SensorCalibration> {
        SensorCalibration::derive(
            GYRO_RANGE_DPS,
            block.gyro_offset,
            block.gyro_sensitivity,
            block.gyro_offset,
        )
    }

    pub fn accel(&self) -> Option<SensorCalibration> {
        self.imu_user
            .as_ref()
            .and_then(|block| self.accel_from(block))
            .or_else(|| self.imu_factory.as_ref().and_then(|block| self.accel_from(block)))
    }

    pub fn gyro(&self) -> Option<SensorCalibration> {
        self.imu_user
            .as_ref()
            .and_then(Self::gyro_from)
            .or_else(|| self.imu_factory.as_ref().and_then(Self::gyro_from))
    }
}
