//! hidapi device backend
//!
//! An enumeration thread refreshes the HID device list on an interval and
//! opens every matching device it has not opened yet. Each opened device gets
//! a reader thread that forwards input reports until the device errors out,
//! at which point it is reported as removed and may be opened again later.
//!
//! Every device is opened twice: the reader thread owns one handle and the
//! writer the other, so writes from the event loop never wait on a read.

use std::collections::HashSet;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::ManagerConfig;
use crate::device::{
    BackendEvent, ConnectionType, DeviceBackend, DeviceId, DeviceInfo, MatchCriteria,
    ReportWriter,
};
use crate::error::{JoyConError, Result};

/// Large enough for every input report the controllers send
pub const REPORT_BUFFER_SIZE: usize = 362;

/// Granularity at which the scanner notices a stop request
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn connection_type(device_info: &hidapi::DeviceInfo) -> ConnectionType {
    // USB devices have interface_number >= 0, Bluetooth typically has -1
    if device_info.interface_number() == -1 {
        ConnectionType::Bluetooth
    } else {
        ConnectionType::Usb
    }
}

fn describe(id: DeviceId, device_info: &hidapi::DeviceInfo) -> DeviceInfo {
    DeviceInfo {
        id,
        vendor_id: device_info.vendor_id(),
        product_id: device_info.product_id(),
        serial: device_info.serial_number().unwrap_or("unknown").to_string(),
        product_name: device_info.product_string().unwrap_or("unknown").to_string(),
        connection_type: connection_type(device_info),
    }
}

fn is_match(criteria: &[MatchCriteria], device_info: &hidapi::DeviceInfo) -> bool {
    criteria
        .iter()
        .any(|c| c.matches(device_info.vendor_id(), device_info.product_id()))
}

/// List matching devices without opening them
pub fn enumerate(criteria: &[MatchCriteria]) -> Result<Vec<DeviceInfo>> {
    let api = HidApi::new()?;
    let devices = api
        .device_list()
        .filter(|d| is_match(criteria, d))
        .enumerate()
        .map(|(i, d)| describe(DeviceId(i as u64 + 1), d))
        .collect();
    Ok(devices)
}

/// Output side of an opened device
///
/// The mutex is only ever taken by writers; reads use a separate handle.
struct HidWriter {
    id: DeviceId,
    device: Arc<Mutex<HidDevice>>,
}

impl ReportWriter for HidWriter {
    fn write_report(&self, report: &[u8]) -> Result<()> {
        let device = self.device.lock().map_err(|_| JoyConError::LockPoisoned)?;
        let written = device.write(report).map_err(|e| JoyConError::WriteFailed {
            device: self.id,
            reason: e.to_string(),
        })?;
        if written < report.len() {
            return Err(JoyConError::ShortWrite {
                written,
                expected: report.len(),
            });
        }
        trace!("{} <- {} bytes", self.id, written);
        Ok(())
    }
}

pub struct HidBackend {
    scan_interval: Duration,
    read_timeout_ms: i32,
    running: Arc<AtomicBool>,
    scanner: Option<JoinHandle<()>>,
}

impl HidBackend {
    pub fn new(scan_interval: Duration, read_timeout_ms: i32) -> Self {
        Self {
            scan_interval,
            read_timeout_ms,
            running: Arc::new(AtomicBool::new(false)),
            scanner: None,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(config.scan_interval(), config.read_timeout_ms)
    }
}

impl DeviceBackend for HidBackend {
    fn start(
        &mut self,
        criteria: &[MatchCriteria],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let scanner = Scanner {
            criteria: criteria.to_vec(),
            events,
            running: Arc::clone(&self.running),
            opened: Arc::new(Mutex::new(HashSet::new())),
            next_id: AtomicU64::new(1),
            scan_interval: self.scan_interval,
            read_timeout_ms: self.read_timeout_ms,
        };

        // HidApi stays on the scanner thread; report whether it came up
        let (init_tx, init_rx) = std_mpsc::channel();
        let handle = thread::Builder::new()
            .name("joycon-scan".to_string())
            .spawn(move || match HidApi::new() {
                Ok(api) => {
                    let _ = init_tx.send(Ok(()));
                    scanner.run(api);
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                }
            })?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                self.scanner = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e.into())
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(JoyConError::ManagerStopped)
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.scanner.take() {
            if handle.join().is_err() {
                error!("HID scanner thread panicked");
            }
        }
        debug!("HID backend stopped");
    }
}

impl Drop for HidBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Scanner {
    criteria: Vec<MatchCriteria>,
    events: mpsc::UnboundedSender<BackendEvent>,
    running: Arc<AtomicBool>,
    /// Paths with a live reader thread
    opened: Arc<Mutex<HashSet<CString>>>,
    next_id: AtomicU64,
    scan_interval: Duration,
    read_timeout_ms: i32,
}

impl Scanner {
    fn run(self, mut api: HidApi) {
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = api.refresh_devices() {
                warn!("Failed to refresh HID devices: {}", e);
            }
            for device_info in api.device_list() {
                if !is_match(&self.criteria, device_info) {
                    continue;
                }
                let path = device_info.path().to_owned();
                let newly_seen = match self.opened.lock() {
                    Ok(mut opened) => opened.insert(path.clone()),
                    Err(_) => false,
                };
                if !newly_seen {
                    continue;
                }
                match self.open(&api, device_info, path.clone()) {
                    Some(reader) => readers.push(reader),
                    None => {
                        if let Ok(mut opened) = self.opened.lock() {
                            opened.remove(&path);
                        }
                    }
                }
            }
            readers.retain(|r| !r.is_finished());
            self.pause();
        }
        for reader in readers {
            let _ = reader.join();
        }
    }

    /// Sleep for one scan interval, returning early once stopped
    fn pause(&self) {
        let mut remaining = self.scan_interval;
        while !remaining.is_zero() && self.running.load(Ordering::SeqCst) {
            let slice = remaining.min(STOP_POLL_INTERVAL);
            thread::sleep(slice);
            remaining -= slice;
        }
    }

    fn open(
        &self,
        api: &HidApi,
        device_info: &hidapi::DeviceInfo,
        path: CString,
    ) -> Option<JoinHandle<()>> {
        let id = DeviceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = describe(id, device_info);
        let (read_handle, write_handle) =
            match (device_info.open_device(api), device_info.open_device(api)) {
                (Ok(read_handle), Ok(write_handle)) => (read_handle, write_handle),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to open {} ({}): {}", info.product_name, info.serial, e);
                    return None;
                }
            };
        info!(
            "Opened {} (serial: {}) via {:?} as {}",
            info.product_name, info.serial, info.connection_type, id
        );

        let writer = HidWriter {
            id,
            device: Arc::new(Mutex::new(write_handle)),
        };
        if self
            .events
            .send(BackendEvent::Added {
                info,
                writer: Box::new(writer),
            })
            .is_err()
        {
            return None;
        }

        let reader = Reader {
            id,
            path,
            device: read_handle,
            events: self.events.clone(),
            running: Arc::clone(&self.running),
            opened: Arc::clone(&self.opened),
            read_timeout_ms: self.read_timeout_ms,
        };
        thread::Builder::new()
            .name(format!("joycon-read-{}", id.0))
            .spawn(move || reader.run())
            .map_err(|e| error!("Failed to spawn reader for {}: {}", id, e))
            .ok()
    }
}

struct Reader {
    id: DeviceId,
    path: CString,
    device: HidDevice,
    events: mpsc::UnboundedSender<BackendEvent>,
    running: Arc<AtomicBool>,
    opened: Arc<Mutex<HashSet<CString>>>,
    read_timeout_ms: i32,
}

impl Reader {
    fn run(self) {
        let mut buf = [0u8; REPORT_BUFFER_SIZE];
        while self.running.load(Ordering::SeqCst) {
            match self.device.read_timeout(&mut buf, self.read_timeout_ms) {
                Ok(0) => continue,
                Ok(n) => {
                    let event = BackendEvent::Input {
                        device: self.id,
                        report: buf[..n].to_vec(),
                    };
                    if self.events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", self.id, e);
                    break;
                }
            }
        }
        let _ = self.events.send(BackendEvent::Removed { device: self.id });
        if let Ok(mut opened) = self.opened.lock() {
            opened.remove(&self.path);
        }
        debug!("Reader for {} exited", self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn scanner(running: bool, scan_interval: Duration) -> Scanner {
        let (events, _) = mpsc::unbounded_channel();
        Scanner {
            criteria: Vec::new(),
            events,
            running: Arc::new(AtomicBool::new(running)),
            opened: Arc::new(Mutex::new(HashSet::new())),
            next_id: AtomicU64::new(1),
            scan_interval,
            read_timeout_ms: 5,
        }
    }

    #[test]
    fn test_pause_returns_once_stopped() {
        let scanner = scanner(true, Duration::from_secs(30));
        let running = Arc::clone(&scanner.running);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            running.store(false, Ordering::SeqCst);
        });
        let started = Instant::now();
        scanner.pause();
        assert!(started.elapsed() < Duration::from_secs(5));
        stopper.join().unwrap();
    }

    #[test]
    fn test_pause_waits_full_interval_while_running() {
        let scanner = scanner(true, Duration::from_millis(60));
        let started = Instant::now();
        scanner.pause();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
