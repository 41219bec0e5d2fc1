//! Controller variants and their report layouts
//!
//! Every variant shares one report-parsing skeleton; what differs is captured
//! by a static [`VariantDescriptor`]: the simple-report usage table, the
//! standard-state bit map and which sticks / sensors the hardware has.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::protocol::{
    JOYCON_L_PRODUCT_ID, JOYCON_R_PRODUCT_ID, PRO_CONTROLLER_PRODUCT_ID,
    SNES_CONTROLLER_PRODUCT_ID,
};
use crate::stick::{Stick, StickDirection};

/// Flash address of the device-type byte used to tell apart controllers
/// sharing a product id
pub const DEVICE_TYPE_ADDRESS: u32 = 0x6012;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerVariant {
    /// Joy-Con (L)
    LeftHalf,
    /// Joy-Con (R)
    RightHalf,
    /// Pro Controller
    FullGamepad,
    /// Famicom Controller (player 1)
    LegacyPlayer1,
    /// Famicom Controller (player 2)
    LegacyPlayer2,
    /// SNES Controller
    LegacySnes,
}

/// How a product id resolves to a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identification {
    Known(ControllerVariant),
    /// Product id is shared; read [`DEVICE_TYPE_ADDRESS`] first
    NeedsDeviceType,
    Unsupported,
}

impl ControllerVariant {
    pub const ALL: [ControllerVariant; 6] = [
        ControllerVariant::LeftHalf,
        ControllerVariant::RightHalf,
        ControllerVariant::FullGamepad,
        ControllerVariant::LegacyPlayer1,
        ControllerVariant::LegacyPlayer2,
        ControllerVariant::LegacySnes,
    ];

    pub fn identify(product_id: u16) -> Identification {
        match product_id {
            JOYCON_L_PRODUCT_ID => Identification::Known(ControllerVariant::LeftHalf),
            JOYCON_R_PRODUCT_ID => Identification::NeedsDeviceType,
            PRO_CONTROLLER_PRODUCT_ID => Identification::Known(ControllerVariant::FullGamepad),
            SNES_CONTROLLER_PRODUCT_ID => Identification::Known(ControllerVariant::LegacySnes),
            _ => Identification::Unsupported,
        }
    }

    /// Resolve the device-type byte read from [`DEVICE_TYPE_ADDRESS`]
    pub fn from_device_type(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(ControllerVariant::RightHalf),
            0x07 => Some(ControllerVariant::LegacyPlayer1),
            0x08 => Some(ControllerVariant::LegacyPlayer2),
            0x0B => Some(ControllerVariant::LegacySnes),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ControllerVariant::LeftHalf => "Joy-Con (L)",
            ControllerVariant::RightHalf => "Joy-Con (R)",
            ControllerVariant::FullGamepad => "Pro Controller",
            ControllerVariant::LegacyPlayer1 => "Famicom Controller 1",
            ControllerVariant::LegacyPlayer2 => "Famicom Controller 2",
            ControllerVariant::LegacySnes => "SNES Controller",
        }
    }

    pub fn descriptor(self) -> &'static VariantDescriptor {
        match self {
            ControllerVariant::LeftHalf => &LEFT_HALF,
            ControllerVariant::RightHalf => &RIGHT_HALF,
            ControllerVariant::FullGamepad => &FULL_GAMEPAD,
            ControllerVariant::LegacyPlayer1 => &LEGACY_PLAYER1,
            ControllerVariant::LegacyPlayer2 => &LEGACY_PLAYER2,
            ControllerVariant::LegacySnes => &LEGACY_SNES,
        }
    }
}

impl fmt::Display for ControllerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical buttons across all variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Button {
    // Joy-Con (L)
    Minus,
    Capture,
    LStick,
    Down,
    Up,
    Right,
    Left,
    LeftSR,
    LeftSL,
    L,
    ZL,

    // Joy-Con (R)
    Plus,
    Home,
    RStick,
    X,
    Y,
    B,
    A,
    RightSR,
    RightSL,
    R,
    ZR,

    // Legacy controllers
    Start,
    Select,
}

impl Button {
    pub const ALL: [Button; 24] = [
        Button::Minus,
        Button::Capture,
        Button::LStick,
        Button::Down,
        Button::Up,
        Button::Right,
        Button::Left,
        Button::LeftSR,
        Button::LeftSL,
        Button::L,
        Button::ZL,
        Button::Plus,
        Button::Home,
        Button::RStick,
        Button::X,
        Button::Y,
        Button::B,
        Button::A,
        Button::RightSR,
        Button::RightSL,
        Button::R,
        Button::ZR,
        Button::Start,
        Button::Select,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Pressed buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonSet(u32);

impl ButtonSet {
    pub fn contains(&self, button: Button) -> bool {
        self.0 & button.bit() != 0
    }

    pub fn set(&mut self, button: Button, pressed: bool) {
        if pressed {
            self.0 |= button.bit();
        } else {
            self.0 &= !button.bit();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Button> + '_ {
        Button::ALL.into_iter().filter(move |b| self.contains(*b))
    }
}

impl Serialize for ButtonSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// What the simple-report hat switch drives
#[derive(Debug)]
pub enum HatMapping {
    /// Hat value indexes a 9-entry direction table for one stick
    Stick(Stick, [StickDirection; 9]),
    /// Hat value is a D-pad position (0 = up, clockwise, 8 = released)
    DPad,
}

impl HatMapping {
    /// D-pad buttons for a hat value
    pub fn dpad_buttons(value: u8) -> [(Button, bool); 4] {
        [
            (Button::Up, matches!(value, 7 | 0 | 1)),
            (Button::Right, matches!(value, 1..=3)),
            (Button::Down, matches!(value, 3..=5)),
            (Button::Left, matches!(value, 5..=7)),
        ]
    }
}

/// Static per-variant layout
#[derive(Debug)]
pub struct VariantDescriptor {
    /// Simple-report usage index to button
    pub usage_map: &'static [(u32, Button)],
    pub hat: HatMapping,
    /// (button byte 0..3, mask, button) in the standard state block
    pub button_bits: &'static [(usize, u8, Button)],
    pub left_stick: bool,
    pub right_stick: bool,
    pub imu: bool,
    pub home_led: bool,
    pub grip_colors: bool,
}

impl VariantDescriptor {
    pub fn button_for_usage(&self, usage: u32) -> Option<Button> {
        self.usage_map
            .iter()
            .find(|(u, _)| *u == usage)
            .map(|(_, button)| *button)
    }

    /// Button states encoded in the three standard-state button bytes
    pub fn decode_buttons(&self, bytes: [u8; 3]) -> impl Iterator<Item = (Button, bool)> + '_ {
        self.button_bits
            .iter()
            .map(move |&(index, mask, button)| (button, bytes[index] & mask != 0))
    }

    pub fn has_stick(&self, stick: Stick) -> bool {
        match stick {
            Stick::Left => self.left_stick,
            Stick::Right => self.right_stick,
        }
    }

    pub fn has_calibration(&self) -> bool {
        self.left_stick || self.right_stick || self.imu
    }
}

use StickDirection::*;

static LEFT_HALF: VariantDescriptor = VariantDescriptor {
    usage_map: &[
        (1, Button::Left),
        (2, Button::Down),
        (3, Button::Up),
        (4, Button::Right),
        (5, Button::LeftSL),
        (6, Button::LeftSR),
        (9, Button::Minus),
        (11, Button::LStick),
        (14, Button::Capture),
        (15, Button::L),
        (16, Button::ZL),
    ],
    hat: HatMapping::Stick(
        Stick::Left,
        [Up, UpRight, Right, DownRight, Down, DownLeft, Left, UpLeft, Neutral],
    ),
    button_bits: &[
        (1, 0x01, Button::Minus),
        (1, 0x08, Button::LStick),
        (1, 0x20, Button::Capture),
        (2, 0x01, Button::Down),
        (2, 0x02, Button::Up),
        (2, 0x04, Button::Right),
        (2, 0x08, Button::Left),
        (2, 0x10, Button::LeftSR),
        (2, 0x20, Button::LeftSL),
        (2, 0x40, Button::L),
        (2, 0x80, Button::ZL),
    ],
    left_stick: true,
    right_stick: false,
    imu: true,
    home_led: false,
    grip_colors: false,
};

static RIGHT_HALF: VariantDescriptor = VariantDescriptor {
    usage_map: &[
        (1, Button::A),
        (2, Button::X),
        (3, Button::B),
        (4, Button::Y),
        (5, Button::RightSL),
        (6, Button::RightSR),
        (10, Button::Plus),
        (12, Button::RStick),
        (13, Button::Home),
        (15, Button::R),
        (16, Button::ZR),
    ],
    hat: HatMapping::Stick(
        Stick::Right,
        [Left, UpLeft, Up, UpRight, Right, DownRight, Down, DownLeft, Neutral],
    ),
    button_bits: &[
        (0, 0x01, Button::Y),
        (0, 0x02, Button::X),
        (0, 0x04, Button::B),
        (0, 0x08, Button::A),
        (0, 0x10, Button::RightSR),
        (0, 0x20, Button::RightSL),
        (0, 0x40, Button::R),
        (0, 0x80, Button::ZR),
        (1, 0x02, Button::Plus),
        (1, 0x04, Button::RStick),
        (1, 0x10, Button::Home),
    ],
    left_stick: false,
    right_stick: true,
    imu: true,
    home_led: true,
    grip_colors: false,
};

static FULL_GAMEPAD: VariantDescriptor = VariantDescriptor {
    usage_map: &[
        (1, Button::B),
        (2, Button::A),
        (3, Button::Y),
        (4, Button::X),
        (5, Button::L),
        (6, Button::R),
        (7, Button::ZL),
        (8, Button::ZR),
        (9, Button::Minus),
        (10, Button::Plus),
        (11, Button::LStick),
        (12, Button::RStick),
        (13, Button::Home),
        (14, Button::Capture),
    ],
    hat: HatMapping::DPad,
    button_bits: &[
        (0, 0x01, Button::Y),
        (0, 0x02, Button::X),
        (0, 0x04, Button::B),
        (0, 0x08, Button::A),
        (0, 0x40, Button::R),
        (0, 0x80, Button::ZR),
        (1, 0x01, Button::Minus),
        (1, 0x02, Button::Plus),
        (1, 0x04, Button::RStick),
        (1, 0x08, Button::LStick),
        (1, 0x10, Button::Home),
        (1, 0x20, Button::Capture),
        (2, 0x01, Button::Down),
        (2, 0x02, Button::Up),
        (2, 0x04, Button::Right),
        (2, 0x08, Button::Left),
        (2, 0x40, Button::L),
        (2, 0x80, Button::ZL),
    ],
    left_stick: true,
    right_stick: true,
    imu: true,
    home_led: true,
    grip_colors: true,
};

static LEGACY_PLAYER1: VariantDescriptor = VariantDescriptor {
    usage_map: &[
        (1, Button::B),
        (2, Button::A),
        (5, Button::L),
        (6, Button::R),
        (9, Button::Select),
        (10, Button::Start),
    ],
    hat: HatMapping::DPad,
    button_bits: &[
        (0, 0x04, Button::B),
        (0, 0x08, Button::A),
        (0, 0x40, Button::R),
        (1, 0x01, Button::Select),
        (1, 0x02, Button::Start),
        (2, 0x01, Button::Down),
        (2, 0x02, Button::Up),
        (2, 0x04, Button::Right),
        (2, 0x08, Button::Left),
        (2, 0x40, Button::L),
    ],
    left_stick: false,
    right_stick: false,
    imu: false,
    home_led: false,
    grip_colors: false,
};

static LEGACY_PLAYER2: VariantDescriptor = VariantDescriptor {
    usage_map: &[(1, Button::B), (2, Button::A), (5, Button::L), (6, Button::R)],
    hat: HatMapping::DPad,
    button_bits: &[
        (0, 0x04, Button::B),
        (0, 0x08, Button::A),
        (0, 0x40, Button::R),
        (2, 0x01, Button::Down),
        (2, 0x02, Button::Up),
        (2, 0x04, Button::Right),
        (2, 0x08, Button::Left),
        (2, 0x40, Button::L),
    ],
    left_stick: false,
    right_stick: false,
    imu: false,
    home_led: false,
    grip_colors: false,
};

static LEGACY_SNES: VariantDescriptor = VariantDescriptor {
    usage_map: &[
        (1, Button::B),
        (2, Button::A),
        (3, Button::Y),
        (4, Button::X),
        (5, Button::L),
        (6, Button::R),
        (7, Button::ZL),
        (9, Button::Select),
        (10, Button::Start),
        (16, Button::ZR),
    ],
    hat: HatMapping::DPad,
    button_bits: &[
        (0, 0x01, Button::Y),
        (0, 0x02, Button::X),
        (0, 0x04, Button::B),
        (0, 0x08, Button::A),
        (0, 0x40, Button::R),
        (0, 0x80, Button::ZR),
        (1, 0x01, Button::Select),
        (1, 0x02, Button::Start),
        (2, 0x01, Button::Down),
        (2, 0x02, Button::Up),
        (2, 0x04, Button::Right),
        (2, 0x08, Button::Left),
        (2, 0x40, Button::L),
        (2, 0x80, Button::ZL),
    ],
    left_stick: false,
    right_stick: false,
    imu: false,
    home_led: false,
    grip_colors: false,
};
