//! Device I/O seam
//!
//! The protocol engine never talks to an OS HID stack directly. A
//! [`DeviceBackend`] discovers matching devices, delivers raw input report
//! buffers and removal notifications as [`BackendEvent`]s, and hands out a
//! [`ReportWriter`] per device for output reports.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;

/// Backend-assigned identifier of an opened device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionType {
    Usb,
    Bluetooth,
}

/// Static properties of a discovered device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
    pub product_name: String,
    pub connection_type: ConnectionType,
}

/// (vendor id, product id) pair a backend should open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchCriteria {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl MatchCriteria {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// Sink for raw output reports of one device
pub trait ReportWriter: Send {
    fn write_report(&self, report: &[u8]) -> Result<()>;
}

/// Notifications delivered by a backend to the manager loop
pub enum BackendEvent {
    Added {
        info: DeviceInfo,
        writer: Box<dyn ReportWriter>,
    },
    Input {
        device: DeviceId,
        report: Vec<u8>,
    },
    Removed {
        device: DeviceId,
    },
}

impl fmt::Debug for BackendEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendEvent::Added { info, .. } => f.debug_struct("Added").field("info", info).finish(),
            BackendEvent::Input { device, report } => f
                .debug_struct("Input")
                .field("device", device)
                .field("len", &report.len())
                .finish(),
            BackendEvent::Removed { device } => {
                f.debug_struct("Removed").field("device", device).finish()
            }
        }
    }
}

/// Host transport that discovers devices and streams their reports
pub trait DeviceBackend: Send {
    /// Begin delivering events for devices matching any of `criteria`.
    fn start(
        &mut self,
        criteria: &[MatchCriteria],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<()>;

    /// Stop delivering events and release all devices.
    fn stop(&mut self);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Writer that records every report for inspection
    #[derive(Clone, Default)]
    pub struct RecordingWriter {
        pub reports: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RecordingWriter {
        pub fn taken(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.reports.lock().unwrap())
        }

        pub fn count(&self) -> usize {
            self.reports.lock().unwrap().len()
        }
    }

    impl ReportWriter for RecordingWriter {
        fn write_report(&self, report: &[u8]) -> Result<()> {
            self.reports.lock().unwrap().push(report.to_vec());
            Ok(())
        }
    }

    /// Backend whose events are pushed by the test through a channel
    pub struct ChannelBackend {
        pub inbox: Arc<Mutex<Option<mpsc::UnboundedSender<BackendEvent>>>>,
    }

    impl ChannelBackend {
        pub fn new() -> (Self, Arc<Mutex<Option<mpsc::UnboundedSender<BackendEvent>>>>) {
            let inbox = Arc::new(Mutex::new(None));
            (
                Self {
                    inbox: Arc::clone(&inbox),
                },
                inbox,
            )
        }
    }

    impl DeviceBackend for ChannelBackend {
        fn start(
            &mut self,
            _criteria: &[MatchCriteria],
            events: mpsc::UnboundedSender<BackendEvent>,
        ) -> Result<()> {
            *self.inbox.lock().unwrap() = Some(events);
            Ok(())
        }

        fn stop(&mut self) {
            self.inbox.lock().unwrap().take();
        }
    }

    pub fn info(id: u64, product_id: u16) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId(id),
            vendor_id: crate::protocol::NINTENDO_VENDOR_ID,
            product_id,
            serial: format!("serial-{}", id),
            product_name: "test controller".to_string(),
            connection_type: ConnectionType::Bluetooth,
        }
    }
}
