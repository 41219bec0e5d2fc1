//! Events published by the controller manager

use serde::Serialize;

use crate::device::DeviceId;
use crate::manager::ControllerHandle;
use crate::protocol::BatteryLevel;
use crate::sensor::MotionSample;
use crate::stick::{Stick, StickDirection, StickReading};
use crate::variant::{Button, ControllerVariant};

/// State change of one controller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    ButtonPressed {
        button: Button,
    },
    ButtonReleased {
        button: Button,
    },
    StickDirectionChanged {
        stick: Stick,
        direction: StickDirection,
        previous: StickDirection,
    },
    /// Emitted for every processed stick sample, changed or not
    StickMoved {
        stick: Stick,
        reading: StickReading,
    },
    Motion {
        sample: MotionSample,
    },
    BatteryChanged {
        level: BatteryLevel,
        previous: BatteryLevel,
    },
    ChargingChanged {
        charging: bool,
    },
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Controller finished initialization and accepts commands
    Connected(ControllerHandle),
    Disconnected {
        device: DeviceId,
        variant: ControllerVariant,
        serial: String,
    },
    Input {
        device: DeviceId,
        event: InputEvent,
    },
}
