//! Error types shared by the protocol engine and the device backends

use thiserror::Error;

use crate::device::DeviceId;
use crate::variant::ControllerVariant;

#[derive(Error, Debug)]
pub enum JoyConError {
    #[error("HID API error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write output report to {device}: {reason}")]
    WriteFailed { device: DeviceId, reason: String },

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("No controller connected as {0}")]
    UnknownDevice(DeviceId),

    #[error("{variant} does not support {feature}")]
    Unsupported {
        variant: ControllerVariant,
        feature: &'static str,
    },

    #[error("Controller manager is not running")]
    ManagerStopped,

    #[error("Device lock poisoned")]
    LockPoisoned,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, JoyConError>;
