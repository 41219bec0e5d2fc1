//! Joy-Con HID wire protocol
//!
//! Byte-exact decoding of input reports and encoding of output reports.
//! All offsets are relative to the start of the raw report buffer, which
//! carries the report id at byte 0.

use serde::{Deserialize, Serialize};

/// Nintendo vendor ID
pub const NINTENDO_VENDOR_ID: u16 = 0x057E;
/// Joy-Con (L) product ID
pub const JOYCON_L_PRODUCT_ID: u16 = 0x2006;
/// Joy-Con (R) product ID, shared with the Nintendo Online legacy controllers over Bluetooth
pub const JOYCON_R_PRODUCT_ID: u16 = 0x2007;
/// Pro Controller product ID
pub const PRO_CONTROLLER_PRODUCT_ID: u16 = 0x2009;
/// SNES Controller product ID
pub const SNES_CONTROLLER_PRODUCT_ID: u16 = 0x2017;

/// Input report IDs
pub const SIMPLE_REPORT_ID: u8 = 0x3F;
pub const COMMAND_REPORT_ID: u8 = 0x21;
pub const FULL_REPORT_ID: u8 = 0x30;
pub const FULL_NFC_IR_REPORT_ID: u8 = 0x31;

/// Standard state block offsets
pub const BATTERY_OFFSET: usize = 2;
pub const BUTTONS_OFFSET: usize = 3;
pub const LEFT_STICK_OFFSET: usize = 6;
pub const RIGHT_STICK_OFFSET: usize = 9;
pub const VIBRATION_ACK_OFFSET: usize = 12;
pub const STANDARD_STATE_LEN: usize = 13;

/// Subcommand reply offsets (report 0x21)
pub const ACK_OFFSET: usize = 13;
pub const REPLY_SUBCOMMAND_OFFSET: usize = 14;
pub const REPLY_DATA_OFFSET: usize = 15;

/// Sensor frames (reports 0x30/0x31)
pub const SENSOR_OFFSET: usize = 13;
pub const SENSOR_FRAME_LEN: usize = 12;
pub const MAX_SENSOR_FRAMES: usize = 3;

/// Usage index of the hat switch in simple reports
pub const HAT_USAGE: u32 = 57;

/// Rumble state sent when no vibration is requested
pub const NEUTRAL_RUMBLE: [u8; 8] = [0x00, 0x01, 0x00, 0x40, 0x00, 0x01, 0x00, 0x40];

/// Output report types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputType {
    Subcommand = 0x01,
    FirmwareUpdate = 0x03,
    Rumble = 0x10,
    NfcIr = 0x11,
}

/// Bluetooth HID subcommands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum SubcommandId {
    GetControllerState = 0x00,
    ManualPairing = 0x01,
    GetDeviceInfo = 0x02,
    SetInputMode = 0x03,
    GetTriggerTime = 0x04,
    GetPageListState = 0x05,
    SetHciState = 0x06,
    ResetPairingInfo = 0x07,
    SetLowPowerState = 0x08,
    ReadSpiFlash = 0x10,
    WriteSpiFlash = 0x11,
    EraseSpiSector = 0x12,
    ResetNfcIr = 0x20,
    SetNfcIrConfig = 0x21,
    SetNfcIrState = 0x22,
    SetPlayerLights = 0x30,
    GetPlayerLights = 0x31,
    SetHomeLight = 0x38,
    EnableImu = 0x40,
    SetImuSensitivity = 0x41,
    WriteImuRegisters = 0x42,
    ReadImuRegisters = 0x43,
    EnableVibration = 0x48,
    GetRegulatedVoltage = 0x50,
    SetGpioValue = 0x51,
    GetGpioValue = 0x52,
}

impl SubcommandId {
    pub fn from_u8(value: u8) -> Option<Self> {
        use SubcommandId::*;
        let id = match value {
            0x00 => GetControllerState,
            0x01 => ManualPairing,
            0x02 => GetDeviceInfo,
            0x03 => SetInputMode,
            0x04 => GetTriggerTime,
            0x05 => GetPageListState,
            0x06 => SetHciState,
            0x07 => ResetPairingInfo,
            0x08 => SetLowPowerState,
            0x10 => ReadSpiFlash,
            0x11 => WriteSpiFlash,
            0x12 => EraseSpiSector,
            0x20 => ResetNfcIr,
            0x21 => SetNfcIrConfig,
            0x22 => SetNfcIrState,
            0x30 => SetPlayerLights,
            0x31 => GetPlayerLights,
            0x38 => SetHomeLight,
            0x40 => EnableImu,
            0x41 => SetImuSensitivity,
            0x42 => WriteImuRegisters,
            0x43 => ReadImuRegisters,
            0x48 => EnableVibration,
            0x50 => GetRegulatedVoltage,
            0x51 => SetGpioValue,
            0x52 => GetGpioValue,
            _ => return None,
        };
        Some(id)
    }
}

/// HCI states used by the "Set HCI state" subcommand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HciState {
    Disconnect = 0x00,
    RebootAndReconnect = 0x01,
    RebootAndPair = 0x02,
    RebootAndReconnectHome = 0x04,
}

/// Input report modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InputMode {
    PollingNfcIr = 0x00,
    PollingNfcIrConfig = 0x01,
    PollingNfcIrData = 0x02,
    PollingIrCamera = 0x03,
    StandardFull = 0x30,
    NfcIr = 0x31,
    Simple = 0x3F,
}

/// Battery level reported in the standard state block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BatteryLevel {
    Full,
    Medium,
    Low,
    Critical,
    Empty,
    #[default]
    Unknown,
}

impl BatteryLevel {
    /// Decode the level bits (mask 0xE0) of the battery byte
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0xE0 {
            0x80 => BatteryLevel::Full,
            0x60 => BatteryLevel::Medium,
            0x40 => BatteryLevel::Low,
            0x20 => BatteryLevel::Critical,
            0x00 => BatteryLevel::Empty,
            _ => BatteryLevel::Unknown,
        }
    }
}

/// Wrapping 4-bit counter stamped on every output report
///
/// The device drops reports whose counter does not advance, so a single
/// counter must be shared by every write path of a controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCounter(u8);

impl PacketCounter {
    pub fn next(&mut self) -> u8 {
        self.0 = (self.0 + 1) & 0x0F;
        self.0
    }
}

/// Frame an output report as `[type, counter, payload...]`
pub fn frame_output(output: OutputType, counter: &mut PacketCounter, payload: &[u8]) -> Vec<u8> {
    let mut report = Vec::with_capacity(payload.len() + 2);
    report.push(output as u8);
    report.push(counter.next());
    report.extend_from_slice(payload);
    report
}

/// Build a subcommand output report: rumble state, subcommand id, arguments
pub fn encode_subcommand(
    counter: &mut PacketCounter,
    rumble: &[u8; 8],
    id: SubcommandId,
    args: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(rumble.len() + 1 + args.len());
    payload.extend_from_slice(rumble);
    payload.push(id as u8);
    payload.extend_from_slice(args);
    frame_output(OutputType::Subcommand, counter, &payload)
}

/// Unpack a 3-byte stick sample into two 12-bit values
pub fn decode_stick(bytes: [u8; 3]) -> (u16, u16) {
    let x = bytes[0] as u16 | ((bytes[1] as u16 & 0x0F) << 8);
    let y = (bytes[1] as u16 >> 4) | ((bytes[2] as u16) << 4);
    (x, y)
}

/// Pack two 12-bit values into the 3-byte stick layout
pub fn encode_stick(x: u16, y: u16) -> [u8; 3] {
    [
        (x & 0xFF) as u8,
        (((x >> 8) & 0x0F) as u8) | (((y & 0x0F) as u8) << 4),
        ((y >> 4) & 0xFF) as u8,
    ]
}

/// Standard input state shared by reports 0x21, 0x30 and 0x31
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardState {
    pub battery: u8,
    pub buttons: [u8; 3],
    pub left_stick: (u16, u16),
    pub right_stick: (u16, u16),
    pub vibration_ack: u8,
}

impl StandardState {
    pub fn decode(report: &[u8]) -> Option<Self> {
        if report.len() < STANDARD_STATE_LEN {
            return None;
        }
        let stick = |offset: usize| decode_stick([report[offset], report[offset + 1], report[offset + 2]]);
        Some(Self {
            battery: report[BATTERY_OFFSET],
            buttons: [
                report[BUTTONS_OFFSET],
                report[BUTTONS_OFFSET + 1],
                report[BUTTONS_OFFSET + 2],
            ],
            left_stick: stick(LEFT_STICK_OFFSET),
            right_stick: stick(RIGHT_STICK_OFFSET),
            vibration_ack: report[VIBRATION_ACK_OFFSET],
        })
    }

    pub fn is_charging(&self) -> bool {
        self.battery & 0x10 != 0
    }

    pub fn battery_bits(&self) -> u8 {
        self.battery & 0xE0
    }
}

/// Outcome of the most recent subcommand, carried by report 0x21
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub ack: u8,
    pub subcommand: u8,
    pub data: Vec<u8>,
}

impl CommandReply {
    pub fn decode(report: &[u8]) -> Option<Self> {
        if report.len() <= REPLY_SUBCOMMAND_OFFSET {
            return None;
        }
        Some(Self {
            ack: report[ACK_OFFSET],
            subcommand: report[REPLY_SUBCOMMAND_OFFSET],
            data: report.get(REPLY_DATA_OFFSET..).unwrap_or_default().to_vec(),
        })
    }

    pub fn is_ack(&self) -> bool {
        self.ack & 0x80 != 0
    }
}

/// One raw 6-axis sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorFrame {
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
}

impl SensorFrame {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SENSOR_FRAME_LEN {
            return None;
        }
        let word = |i: usize| i16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Some(Self {
            accel: [word(0), word(2), word(4)],
            gyro: [word(6), word(8), word(10)],
        })
    }
}

/// Decode every complete sensor frame present in a full report
pub fn decode_sensor_frames(report: &[u8]) -> Vec<SensorFrame> {
    (0..MAX_SENSOR_FRAMES)
        .filter_map(|i| {
            let start = SENSOR_OFFSET + i * SENSOR_FRAME_LEN;
            report
                .get(start..start + SENSOR_FRAME_LEN)
                .and_then(SensorFrame::decode)
        })
        .collect()
}

/// A single element of a simple HID report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleInput {
    pub usage: u32,
    pub value: u8,
}

/// Split a simple (0x3F) report into its button usages 1..=16 and the hat switch
pub fn decode_simple_report(report: &[u8]) -> Option<Vec<SimpleInput>> {
    if report.len() < 4 {
        return None;
    }
    let bits = u16::from_le_bytes([report[1], report[2]]);
    let mut inputs: Vec<SimpleInput> = (0..16)
        .map(|bit| SimpleInput {
            usage: bit + 1,
            value: ((bits >> bit) & 0x01) as u8,
        })
        .collect();
    inputs.push(SimpleInput {
        usage: HAT_USAGE,
        value: report[3],
    });
    Some(inputs)
}

/// Parsed input report
#[derive(Debug, Clone, PartialEq)]
pub enum InputReport {
    Simple(Vec<SimpleInput>),
    Command {
        state: StandardState,
        reply: CommandReply,
    },
    Full {
        state: StandardState,
        frames: Vec<SensorFrame>,
        nfc_ir: bool,
    },
}

impl InputReport {
    /// Parse a raw buffer; unknown report ids and truncated buffers yield `None`
    pub fn parse(report: &[u8]) -> Option<Self> {
        match *report.first()? {
            SIMPLE_REPORT_ID => decode_simple_report(report).map(InputReport::Simple),
            COMMAND_REPORT_ID => Some(InputReport::Command {
                state: StandardState::decode(report)?,
                reply: CommandReply::decode(report)?,
            }),
            id @ (FULL_REPORT_ID | FULL_NFC_IR_REPORT_ID) => Some(InputReport::Full {
                state: StandardState::decode(report)?,
                frames: decode_sensor_frames(report),
                nfc_ir: id == FULL_NFC_IR_REPORT_ID,
            }),
            _ => None,
        }
    }
}

/// Player light state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerLight {
    #[default]
    Off,
    On,
    Flash,
}

/// The four player lights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerLights(pub [PlayerLight; 4]);

impl PlayerLights {
    /// Parse a 4-character pattern of `0` (off), `1` (on) and `f` (flash)
    pub fn from_pattern(pattern: &str) -> Option<Self> {
        let chars: Vec<char> = pattern.chars().collect();
        if chars.len() != 4 {
            return None;
        }
        let mut lights = [PlayerLight::Off; 4];
        for (light, c) in lights.iter_mut().zip(chars) {
            *light = match c.to_ascii_lowercase() {
                '0' => PlayerLight::Off,
                '1' => PlayerLight::On,
                'f' => PlayerLight::Flash,
                _ => return None,
            };
        }
        Some(Self(lights))
    }

    /// Low nibble: steady on bits, high nibble: flash bits
    pub fn encode(&self) -> u8 {
        self.0.iter().enumerate().fold(0u8, |acc, (i, light)| match light {
            PlayerLight::On => acc | (1 << i),
            PlayerLight::Flash => acc | (1 << (i + 4)),
            PlayerLight::Off => acc,
        })
    }
}

/// One cycle of a HOME LED pattern; every field is a 4-bit value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HomeLightCycle {
    pub intensity: u8,
    pub fade_duration: u8,
    pub duration: u8,
}

/// HOME LED pattern
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HomeLight {
    /// Global mini cycle duration (0 off, 1 = 8ms .. 15 = 175ms)
    pub mini_cycle_duration: u8,
    /// Number of full cycles, 0 repeats forever
    pub num_cycles: u8,
    pub start_intensity: u8,
    /// At most 15 cycles are transmitted
    pub cycles: Vec<HomeLightCycle>,
}

impl HomeLight {
    pub const MAX_CYCLES: usize = 15;

    /// Encode as the 25-byte subcommand argument
    pub fn encode(&self) -> Vec<u8> {
        let num_cycles = self.cycles.len().min(Self::MAX_CYCLES) as u8;
        let mut data = Vec::with_capacity(26);
        data.push((num_cycles << 4) | (self.mini_cycle_duration & 0x0F));
        data.push(((self.start_intensity & 0x0F) << 4) | (self.num_cycles & 0x0F));

        let mut slots = [HomeLightCycle::default(); 16];
        for (slot, cycle) in slots.iter_mut().zip(self.cycles.iter().take(Self::MAX_CYCLES)) {
            *slot = *cycle;
        }
        for pair in slots.chunks(2) {
            let (a, b) = (pair[0], pair[1]);
            data.push((a.intensity.min(0x0F) << 4) | b.intensity.min(0x0F));
            data.push((a.fade_duration.min(0x0F) << 4) | a.duration.min(0x0F));
            data.push((b.fade_duration.min(0x0F) << 4) | b.duration.min(0x0F));
        }
        // The 16th slot only exists to complete the last pair
        data.pop();
        data
    }
}

/// Encoded high-band rumble frequency (7-bit table index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighFrequency(pub u8);

/// Encoded low-band rumble frequency (7-bit table index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowFrequency(pub u8);

fn encoded_frequency(hz: f32) -> i32 {
    ((hz.max(1.0) / 10.0).log2() * 32.0).round() as i32
}

impl HighFrequency {
    /// 320 Hz
    pub const DEFAULT: HighFrequency = HighFrequency(0x40);

    pub fn from_hz(hz: f32) -> Self {
        Self((encoded_frequency(hz) - 0x60).clamp(0, 0x7F) as u8)
    }
}

impl LowFrequency {
    /// 160 Hz
    pub const DEFAULT: LowFrequency = LowFrequency(0x40);

    pub fn from_hz(hz: f32) -> Self {
        Self((encoded_frequency(hz) - 0x40).clamp(0, 0x7F) as u8)
    }
}

/// Rumble parameters for one side; amplitudes are clamped to 0..=100
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RumbleSide {
    pub high_freq: HighFrequency,
    pub high_amp: u8,
    pub low_freq: LowFrequency,
    pub low_amp: u8,
}

impl RumbleSide {
    pub fn off() -> Self {
        Self {
            high_freq: HighFrequency::DEFAULT,
            high_amp: 0,
            low_freq: LowFrequency::DEFAULT,
            low_amp: 0,
        }
    }

    pub fn encode(&self) -> [u8; 4] {
        let high_freq = self.high_freq.0 & 0x7F;
        let low_freq = self.low_freq.0 & 0x7F;
        let high_amp = self.high_amp.min(100);
        let low_amp = self.low_amp.min(100);
        [
            high_freq << 2,
            (high_amp << 1) | ((high_freq >> 6) & 0x01),
            low_freq | (low_amp << 7),
            0x40 | ((low_amp >> 1) & 0x3F),
        ]
    }
}

/// Rumble for both sides of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumble {
    pub left: RumbleSide,
    pub right: RumbleSide,
}

impl Rumble {
    pub fn off() -> Self {
        Self {
            left: RumbleSide::off(),
            right: RumbleSide::off(),
        }
    }

    /// Same parameters on both sides
    pub fn both(side: RumbleSide) -> Self {
        Self {
            left: side,
            right: side,
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&self.left.encode());
        data[4..].copy_from_slice(&self.right.encode());
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommand_id_from_byte() {
        assert_eq!(SubcommandId::from_u8(0x10), Some(SubcommandId::ReadSpiFlash));
        assert_eq!(SubcommandId::from_u8(0x48), Some(SubcommandId::EnableVibration));
        assert_eq!(SubcommandId::from_u8(0x13), None);
    }

    fn full_report() -> Vec<u8> {
        let mut report = vec![0u8; 49];
        report[0] = FULL_REPORT_ID;
        report
    }

    #[test]
    fn test_stick_round_trip_edges() {
        for &(x, y) in &[(0u16, 0u16), (0xFFF, 0xFFF), (0x800, 0x7FF), (0x123, 0xABC), (1, 0xFFE)] {
            assert_eq!(decode_stick(encode_stick(x, y)), (x, y));
        }
    }

    #[test]
    fn test_stick_round_trip_all_pairs() {
        for x in (0..0x1000u16).step_by(7) {
            for y in (0..0x1000u16).step_by(13) {
                assert_eq!(decode_stick(encode_stick(x, y)), (x, y));
            }
        }
    }

    #[test]
    fn test_decode_stick_layout() {
        // x = b0 | (b1 & 0x0F) << 8, y = b1 >> 4 | b2 << 4
        assert_eq!(decode_stick([0x34, 0x62, 0x85]), (0x234, 0x856));
    }

    #[test]
    fn test_packet_counter_wraps() {
        let mut counter = PacketCounter::default();
        let values: Vec<u8> = (0..17).map(|_| counter.next()).collect();
        assert_eq!(values[0], 1);
        assert_eq!(values[14], 15);
        assert_eq!(values[15], 0);
        assert_eq!(values[16], 1);
    }

    #[test]
    fn test_encode_subcommand_framing() {
        let mut counter = PacketCounter::default();
        let report = encode_subcommand(&mut counter, &NEUTRAL_RUMBLE, SubcommandId::EnableImu, &[1]);
        assert_eq!(report[0], 0x01);
        assert_eq!(report[1], 1);
        assert_eq!(&report[2..10], &NEUTRAL_RUMBLE);
        assert_eq!(report[10], 0x40);
        assert_eq!(report[11], 1);
    }

    #[test]
    fn test_parse_unknown_report_is_ignored() {
        assert_eq!(InputReport::parse(&[0x99, 0, 0, 0]), None);
        assert_eq!(InputReport::parse(&[]), None);
        assert_eq!(InputReport::parse(&[FULL_REPORT_ID, 0, 0]), None);
    }

    #[test]
    fn test_parse_full_report_frames() {
        let mut report = full_report();
        report[BATTERY_OFFSET] = 0x90;
        report[SENSOR_OFFSET..SENSOR_OFFSET + 2].copy_from_slice(&(-100i16).to_le_bytes());
        report[SENSOR_OFFSET + 24 + 10..SENSOR_OFFSET + 24 + 12].copy_from_slice(&77i16.to_le_bytes());
        match InputReport::parse(&report) {
            Some(InputReport::Full { state, frames, nfc_ir }) => {
                assert!(!nfc_ir);
                assert!(state.is_charging());
                assert_eq!(BatteryLevel::from_bits(state.battery_bits()), BatteryLevel::Full);
                assert_eq!(frames.len(), 3);
                assert_eq!(frames[0].accel[0], -100);
                assert_eq!(frames[2].gyro[2], 77);
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_full_report_partial_frames() {
        let mut report = full_report();
        report.truncate(SENSOR_OFFSET + SENSOR_FRAME_LEN + 5);
        match InputReport::parse(&report) {
            Some(InputReport::Full { frames, .. }) => assert_eq!(frames.len(), 1),
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_command_reply() {
        let mut report = vec![0u8; 49];
        report[0] = COMMAND_REPORT_ID;
        report[ACK_OFFSET] = 0x90;
        report[REPLY_SUBCOMMAND_OFFSET] = 0x10;
        report[REPLY_DATA_OFFSET] = 0xAB;
        match InputReport::parse(&report) {
            Some(InputReport::Command { reply, .. }) => {
                assert!(reply.is_ack());
                assert_eq!(reply.subcommand, 0x10);
                assert_eq!(reply.data[0], 0xAB);
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_simple_report_usages() {
        let report = [SIMPLE_REPORT_ID, 0b0000_0101, 0b1000_0000, 8, 0, 0];
        let inputs = decode_simple_report(&report).unwrap();
        assert_eq!(inputs.len(), 17);
        let pressed: Vec<u32> = inputs
            .iter()
            .filter(|i| i.usage != HAT_USAGE && i.value != 0)
            .map(|i| i.usage)
            .collect();
        assert_eq!(pressed, vec![1, 3, 16]);
        assert_eq!(inputs.last(), Some(&SimpleInput { usage: HAT_USAGE, value: 8 }));
    }

    #[test]
    fn test_player_lights_encoding() {
        let lights = PlayerLights::from_pattern("1f0F").unwrap();
        assert_eq!(lights.encode(), 0x01 | 0x20 | 0x80);
        assert!(PlayerLights::from_pattern("10").is_none());
        assert!(PlayerLights::from_pattern("10x0").is_none());
    }

    #[test]
    fn test_home_light_encoding() {
        let light = HomeLight {
            mini_cycle_duration: 0x0F,
            num_cycles: 0,
            start_intensity: 0x0F,
            cycles: vec![
                HomeLightCycle { intensity: 0x0F, fade_duration: 0x0F, duration: 0 },
                HomeLightCycle { intensity: 0x00, fade_duration: 0x0F, duration: 0 },
            ],
        };
        let data = light.encode();
        assert_eq!(data.len(), 25);
        assert_eq!(data[0], 0x2F);
        assert_eq!(data[1], 0xF0);
        assert_eq!(data[2], 0xF0);
        assert_eq!(data[3], 0xF0);
        assert_eq!(data[4], 0xF0);
        assert!(data[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_home_light_truncates_to_fifteen_cycles() {
        let light = HomeLight {
            cycles: vec![HomeLightCycle { intensity: 1, fade_duration: 2, duration: 3 }; 20],
            ..HomeLight::default()
        };
        let data = light.encode();
        assert_eq!(data.len(), 25);
        assert_eq!(data[0] >> 4, 15);
        // 15th cycle sits in the last pair: intensity high nibble, its timing in the byte after
        assert_eq!(data[23] >> 4, 1);
        assert_eq!(data[24], 0x23);
    }

    #[test]
    fn test_rumble_encoding() {
        let side = RumbleSide {
            high_freq: HighFrequency(0x7F),
            high_amp: 200,
            low_freq: LowFrequency(0x01),
            low_amp: 3,
        };
        let bytes = side.encode();
        assert_eq!(bytes[0], 0xFC);
        assert_eq!(bytes[1], (100 << 1) | 0x01);
        assert_eq!(bytes[2], 0x81);
        assert_eq!(bytes[3], 0x41);
    }

    #[test]
    fn test_rumble_frequency_from_hz() {
        assert_eq!(HighFrequency::from_hz(320.0), HighFrequency(0x40));
        assert_eq!(LowFrequency::from_hz(160.0), LowFrequency(0x40));
        assert_eq!(HighFrequency::from_hz(10.0), HighFrequency(0));
        assert_eq!(LowFrequency::from_hz(100_000.0), LowFrequency(0x7F));
    }
}
