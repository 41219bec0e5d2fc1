//! Joy-Con / Pro Controller protocol engine
//!
//! Decodes HID input reports from Nintendo Switch controllers and the
//! Nintendo Switch Online legacy controllers, loads calibration from their
//! SPI flash, runs the subcommand transaction protocol and publishes typed
//! input events. Device I/O goes through the [`device::DeviceBackend`] seam;
//! [`hid::HidBackend`] implements it with hidapi.

pub mod calibration;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod events;
pub mod flash;
pub mod hid;
pub mod manager;
pub mod protocol;
pub mod sensor;
pub mod stick;
pub mod subcommand;
pub mod variant;

pub use controller::ControllerSnapshot;
pub use error::{JoyConError, Result};
pub use events::{InputEvent, ManagerEvent};
pub use manager::{ControllerHandle, ControllerManager, ManagerHandle};
