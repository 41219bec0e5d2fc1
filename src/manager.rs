//! Controller manager event loop
//!
//! One task owns every [`Controller`]. Backend notifications, caller commands
//! and subcommand deadlines all arrive as messages on that task, so
//! controller state is never touched concurrently. Callers interact through
//! cloneable [`ManagerHandle`] / [`ControllerHandle`] values and observe
//! state changes through a broadcast stream of [`ManagerEvent`]s.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, ManagerConfig, OnConnectConfig};
use crate::controller::{Controller, ControllerSnapshot, ReplySender};
use crate::device::{BackendEvent, DeviceBackend, DeviceId, DeviceInfo, MatchCriteria, ReportWriter};
use crate::error::{JoyConError, Result};
use crate::events::ManagerEvent;
use crate::flash::{self, FlashChunk};
use crate::protocol::{
    encode_subcommand, HciState, HomeLight, InputMode, InputReport, PacketCounter, PlayerLights,
    Rumble, SubcommandId, JOYCON_L_PRODUCT_ID, JOYCON_R_PRODUCT_ID, NEUTRAL_RUMBLE,
    NINTENDO_VENDOR_ID, PRO_CONTROLLER_PRODUCT_ID, SNES_CONTROLLER_PRODUCT_ID,
};
use crate::variant::{ControllerVariant, Identification, DEVICE_TYPE_ADDRESS};

/// Imperative controller commands
#[derive(Debug, Clone)]
pub enum Command {
    Rumble(Rumble),
    Subcommand(SubcommandId, Vec<u8>),
    SetHciState(HciState),
    SetInputMode(InputMode),
    SetPlayerLights(PlayerLights),
    SetHomeLight(HomeLight),
    EnableImu(bool),
    EnableVibration(bool),
    ReadFlash { address: u32, length: u8 },
}

enum LoopMessage {
    Command {
        device: DeviceId,
        command: Command,
        accepted: oneshot::Sender<Result<()>>,
        reply: ReplySender,
    },
    Snapshot {
        device: DeviceId,
        reply: oneshot::Sender<Option<ControllerSnapshot>>,
    },
    List {
        reply: oneshot::Sender<Vec<ControllerSnapshot>>,
    },
    Expired {
        device: DeviceId,
        seq: u64,
    },
    Stop,
}

/// Product ids opened by the manager
pub fn match_criteria() -> Vec<MatchCriteria> {
    [
        JOYCON_L_PRODUCT_ID,
        JOYCON_R_PRODUCT_ID,
        PRO_CONTROLLER_PRODUCT_ID,
        SNES_CONTROLLER_PRODUCT_ID,
    ]
    .into_iter()
    .map(|product_id| MatchCriteria {
        vendor_id: NINTENDO_VENDOR_ID,
        product_id,
    })
    .collect()
}

pub struct ControllerManager {
    config: ManagerConfig,
    setup: OnConnectConfig,
    events: broadcast::Sender<ManagerEvent>,
    inbox_tx: mpsc::UnboundedSender<LoopMessage>,
    inbox_rx: mpsc::UnboundedReceiver<LoopMessage>,
}

impl ControllerManager {
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(config.manager.event_capacity.max(1));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            config: config.manager.clone(),
            setup: config.on_connect.clone(),
            events,
            inbox_tx,
            inbox_rx,
        }
    }

    /// Subscribe before calling [`run`](Self::run) to see every connection
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            tx: self.inbox_tx.clone(),
        }
    }

    /// Run the event loop on the current task until stopped
    pub async fn run<B: DeviceBackend>(self, mut backend: B) -> Result<()> {
        let (backend_tx, mut backend_rx) = mpsc::unbounded_channel();
        backend.start(&match_criteria(), backend_tx)?;
        info!("Controller manager started");

        let mut inbox = self.inbox_rx;
        let mut state = EventLoop {
            timeout: self.config.subcommand_timeout(),
            setup: self.setup,
            events: self.events,
            inbox: self.inbox_tx,
            controllers: HashMap::new(),
            pending: HashMap::new(),
            timers: HashMap::new(),
        };

        loop {
            tokio::select! {
                event = backend_rx.recv() => match event {
                    Some(event) => state.handle_backend(event),
                    None => {
                        warn!("Device backend closed its event channel");
                        break;
                    }
                },
                message = inbox.recv() => match message {
                    Some(LoopMessage::Stop) | None => break,
                    Some(message) => state.handle_message(message),
                },
            }
        }

        state.shutdown();
        backend.stop();
        info!("Controller manager stopped");
        Ok(())
    }

    /// Run the event loop on a separate task
    pub fn spawn<B: DeviceBackend + 'static>(self, backend: B) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(backend))
    }
}

/// Device waiting for its device-type byte
struct PendingDevice {
    info: DeviceInfo,
    writer: Box<dyn ReportWriter>,
    counter: PacketCounter,
}

struct Timer {
    seq: u64,
    task: JoinHandle<()>,
}

struct EventLoop {
    timeout: Duration,
    setup: OnConnectConfig,
    events: broadcast::Sender<ManagerEvent>,
    inbox: mpsc::UnboundedSender<LoopMessage>,
    controllers: HashMap<DeviceId, Controller>,
    pending: HashMap<DeviceId, PendingDevice>,
    timers: HashMap<DeviceId, Timer>,
}

impl EventLoop {
    fn emit(&self, event: ManagerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn handle_backend(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Added { info, writer } => self.device_added(info, writer),
            BackendEvent::Input { device, report } => {
                if let Some(controller) = self.controllers.get_mut(&device) {
                    controller.handle_report(&report);
                    self.after_update(device);
                } else if self.pending.contains_key(&device) {
                    self.identification_reply(device, &report);
                } else {
                    trace!("Report from unknown {}", device);
                }
            }
            BackendEvent::Removed { device } => self.device_removed(device),
        }
    }

    fn device_added(&mut self, info: DeviceInfo, writer: Box<dyn ReportWriter>) {
        if self.controllers.contains_key(&info.id) || self.pending.contains_key(&info.id) {
            debug!("{} is already known; ignoring", info.id);
            return;
        }
        match ControllerVariant::identify(info.product_id) {
            Identification::Known(variant) => {
                self.attach(info, variant, writer, PacketCounter::default());
            }
            Identification::NeedsDeviceType => {
                info!(
                    "Identifying {} ({:04x}:{:04x})",
                    info.id, info.vendor_id, info.product_id
                );
                let mut counter = PacketCounter::default();
                let report = encode_subcommand(
                    &mut counter,
                    &NEUTRAL_RUMBLE,
                    SubcommandId::ReadSpiFlash,
                    &flash::encode_read(DEVICE_TYPE_ADDRESS, 1),
                );
                if let Err(e) = writer.write_report(&report) {
                    warn!("Failed to query device type of {}: {}", info.id, e);
                }
                self.pending.insert(
                    info.id,
                    PendingDevice {
                        info,
                        writer,
                        counter,
                    },
                );
            }
            Identification::Unsupported => {
                debug!("Ignoring unsupported product {:04x}", info.product_id);
            }
        }
    }

    /// Only the device-type reply is of interest while identifying
    fn identification_reply(&mut self, device: DeviceId, report: &[u8]) {
        let Some(InputReport::Command { reply, .. }) = InputReport::parse(report) else {
            return;
        };
        let is_flash_reply =
            SubcommandId::from_u8(reply.subcommand) == Some(SubcommandId::ReadSpiFlash);
        if !reply.is_ack() || !is_flash_reply {
            return;
        }
        let Some(chunk) = FlashChunk::decode(&reply.data) else {
            return;
        };
        if chunk.address != DEVICE_TYPE_ADDRESS {
            return;
        }
        let Some(&code) = chunk.data.first() else {
            return;
        };
        match ControllerVariant::from_device_type(code) {
            Some(variant) => {
                if let Some(pending) = self.pending.remove(&device) {
                    info!("{} identified as {}", device, variant);
                    self.attach(pending.info, variant, pending.writer, pending.counter);
                }
            }
            None => warn!("{} reported unknown device type {:#04x}", device, code),
        }
    }

    fn attach(
        &mut self,
        info: DeviceInfo,
        variant: ControllerVariant,
        writer: Box<dyn ReportWriter>,
        counter: PacketCounter,
    ) {
        info!(
            "Found {} ({}) via {:?}",
            variant, info.serial, info.connection_type
        );
        let device = info.id;
        let mut controller = Controller::new(info, variant, writer, counter);
        controller.start();
        self.controllers.insert(device, controller);
        self.after_update(device);
    }

    fn device_removed(&mut self, device: DeviceId) {
        if self.pending.remove(&device).is_some() {
            debug!("Unidentified {} removed", device);
        }
        self.cancel_timer(device);
        if let Some(mut controller) = self.controllers.remove(&device) {
            controller.close();
            info!("{} ({}) disconnected", controller.variant(), controller.info().serial);
            self.emit(ManagerEvent::Disconnected {
                device,
                variant: controller.variant(),
                serial: controller.info().serial.clone(),
            });
        }
    }

    fn handle_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Command {
                device,
                command,
                accepted,
                reply,
            } => {
                let result = match self.controllers.get_mut(&device) {
                    Some(controller) => execute(controller, command, reply),
                    None => Err(JoyConError::UnknownDevice(device)),
                };
                let _ = accepted.send(result);
                self.after_update(device);
            }
            LoopMessage::Snapshot { device, reply } => {
                let _ = reply.send(self.controllers.get(&device).map(Controller::snapshot));
            }
            LoopMessage::List { reply } => {
                let mut snapshots: Vec<_> = self.controllers.values().map(Controller::snapshot).collect();
                snapshots.sort_by_key(|s| s.device);
                let _ = reply.send(snapshots);
            }
            LoopMessage::Expired { device, seq } => {
                if let Some(controller) = self.controllers.get_mut(&device) {
                    controller.expire(seq);
                    self.after_update(device);
                }
            }
            LoopMessage::Stop => {}
        }
    }

    /// Publish what a controller produced and keep its deadline in sync
    fn after_update(&mut self, device: DeviceId) {
        let Some(controller) = self.controllers.get_mut(&device) else {
            self.cancel_timer(device);
            return;
        };
        if controller.take_ready() {
            let handle = ControllerHandle {
                info: controller.info().clone(),
                variant: controller.variant(),
                tx: self.inbox.clone(),
            };
            apply_setup(controller, &self.setup);
            // subscribers see the connection before any input
            let _ = self.events.send(ManagerEvent::Connected(handle));
        }
        for event in controller.take_events() {
            let _ = self.events.send(ManagerEvent::Input { device, event });
        }
        let seq = controller.in_flight_seq();
        self.sync_timer(device, seq);
    }

    fn sync_timer(&mut self, device: DeviceId, seq: Option<u64>) {
        if let (Some(timer), Some(seq)) = (self.timers.get(&device), seq) {
            if timer.seq == seq {
                return;
            }
        }
        self.cancel_timer(device);
        let Some(seq) = seq else {
            return;
        };
        let inbox = self.inbox.clone();
        let timeout = self.timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(LoopMessage::Expired { device, seq });
        });
        self.timers.insert(device, Timer { seq, task });
    }

    fn cancel_timer(&mut self, device: DeviceId) {
        if let Some(timer) = self.timers.remove(&device) {
            timer.task.abort();
        }
    }

    /// Discard all controllers without resolving their outstanding requests
    fn shutdown(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
        for (_, mut controller) in self.controllers.drain() {
            controller.close();
        }
        self.pending.clear();
    }
}

fn execute(controller: &mut Controller, command: Command, reply: ReplySender) -> Result<()> {
    match command {
        Command::Rumble(rumble) => controller.send_rumble(&rumble),
        Command::Subcommand(id, args) => {
            controller.send_subcommand(id, args, Some(reply));
            Ok(())
        }
        Command::SetHciState(state) => {
            controller.set_hci_state(state, Some(reply));
            Ok(())
        }
        Command::SetInputMode(mode) => {
            controller.set_input_mode(mode, Some(reply));
            Ok(())
        }
        Command::SetPlayerLights(lights) => {
            controller.set_player_lights(lights, Some(reply));
            Ok(())
        }
        Command::SetHomeLight(pattern) => controller.set_home_light(&pattern, Some(reply)),
        Command::EnableImu(enabled) => controller.enable_imu(enabled, Some(reply)),
        Command::EnableVibration(enabled) => {
            controller.enable_vibration(enabled, Some(reply));
            Ok(())
        }
        Command::ReadFlash { address, length } => controller.read_flash(address, length, reply),
    }
}

fn apply_setup(controller: &mut Controller, setup: &OnConnectConfig) {
    if let Some(mode) = setup.input_mode {
        controller.set_input_mode(mode, None);
    }
    if setup.enable_imu && controller.variant().descriptor().imu {
        if let Err(e) = controller.enable_imu(true, None) {
            debug!("Skipping IMU setup: {}", e);
        }
    }
    if setup.enable_vibration {
        controller.enable_vibration(true, None);
    }
    if let Some(lights) = setup.lights() {
        controller.set_player_lights(lights, None);
    }
}

/// Handle to the manager loop
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl ManagerHandle {
    /// Snapshots of every ready or initializing controller
    pub async fn controllers(&self) -> Result<Vec<ControllerSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoopMessage::List { reply })
            .map_err(|_| JoyConError::ManagerStopped)?;
        rx.await.map_err(|_| JoyConError::ManagerStopped)
    }

    /// Stop the loop; outstanding requests are abandoned
    pub fn stop(&self) {
        let _ = self.tx.send(LoopMessage::Stop);
    }
}

/// Handle to one connected controller
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    info: DeviceInfo,
    variant: ControllerVariant,
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl ControllerHandle {
    pub fn id(&self) -> DeviceId {
        self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn variant(&self) -> ControllerVariant {
        self.variant
    }

    pub fn serial(&self) -> &str {
        &self.info.serial
    }

    /// Queue a command and wait for its subcommand outcome
    ///
    /// `None` means NACK, timeout or that the controller went away; the
    /// three are indistinguishable.
    pub async fn execute(&self, command: Command) -> Result<Option<Vec<u8>>> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(LoopMessage::Command {
                device: self.info.id,
                command,
                accepted,
                reply,
            })
            .map_err(|_| JoyConError::ManagerStopped)?;
        accepted_rx.await.map_err(|_| JoyConError::ManagerStopped)??;
        Ok(reply_rx.await.unwrap_or(None))
    }

    async fn acked(&self, command: Command) -> Result<bool> {
        Ok(self.execute(command).await?.is_some())
    }

    /// Write a rumble-only report; completes once written
    pub async fn send_rumble(&self, rumble: Rumble) -> Result<()> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (reply, _) = oneshot::channel();
        self.tx
            .send(LoopMessage::Command {
                device: self.info.id,
                command: Command::Rumble(rumble),
                accepted,
                reply,
            })
            .map_err(|_| JoyConError::ManagerStopped)?;
        accepted_rx.await.map_err(|_| JoyConError::ManagerStopped)?
    }

    pub async fn set_hci_state(&self, state: HciState) -> Result<bool> {
        self.acked(Command::SetHciState(state)).await
    }

    pub async fn set_input_mode(&self, mode: InputMode) -> Result<bool> {
        self.acked(Command::SetInputMode(mode)).await
    }

    pub async fn set_player_lights(&self, lights: PlayerLights) -> Result<bool> {
        self.acked(Command::SetPlayerLights(lights)).await
    }

    pub async fn set_home_light(&self, pattern: HomeLight) -> Result<bool> {
        self.acked(Command::SetHomeLight(pattern)).await
    }

    pub async fn enable_imu(&self, enabled: bool) -> Result<bool> {
        self.acked(Command::EnableImu(enabled)).await
    }

    pub async fn enable_vibration(&self, enabled: bool) -> Result<bool> {
        self.acked(Command::EnableVibration(enabled)).await
    }

    /// Read `length` bytes of SPI flash; `None` when the device did not answer
    pub async fn read_flash(&self, address: u32, length: u8) -> Result<Option<Vec<u8>>> {
        self.execute(Command::ReadFlash { address, length }).await
    }

    /// Send an arbitrary subcommand and return the raw reply data
    pub async fn send_subcommand(&self, id: SubcommandId, args: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.execute(Command::Subcommand(id, args)).await
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoopMessage::Snapshot {
                device: self.info.id,
                reply,
            })
            .map_err(|_| JoyConError::ManagerStopped)?;
        rx.await
            .map_err(|_| JoyConError::ManagerStopped)?
            .ok_or(JoyConError::UnknownDevice(self.info.id))
    }
}
