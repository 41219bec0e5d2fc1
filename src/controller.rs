//! Per-controller protocol state machine
//!
//! A [`Controller`] owns everything the engine knows about one connected
//! device: its variant, the output packet counter, the subcommand queue,
//! pending flash reads, calibration and the last decoded input state. It does
//! no waiting of its own. The manager feeds it raw reports and deadline
//! expiries, then drains the [`InputEvent`]s it produced and re-arms the
//! subcommand timer whenever [`Controller::in_flight_seq`] changes.
//!
//! Initialization reads the colors, then every calibration block the variant
//! owns, and only then reports ready.

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::calibration::{
    CalibrationStore, ACCEL_OFFSET_ADDRESS, ACCEL_OFFSET_LEN, IMU_FACTORY_ADDRESS,
    IMU_FACTORY_LEN, IMU_USER_ADDRESS, IMU_USER_LEN, LEFT_STICK_FACTORY_ADDRESS,
    LEFT_STICK_PARAMETERS_ADDRESS, LEFT_STICK_USER_ADDRESS, RIGHT_STICK_FACTORY_ADDRESS,
    RIGHT_STICK_PARAMETERS_ADDRESS, RIGHT_STICK_USER_ADDRESS, STICK_FACTORY_LEN,
    STICK_PARAMETERS_LEN, STICK_USER_LEN,
};
use crate::device::{ConnectionType, DeviceId, DeviceInfo, ReportWriter};
use crate::error::{JoyConError, Result};
use crate::events::InputEvent;
use crate::flash::{self, FlashChunk, PendingReads};
use crate::protocol::{
    encode_subcommand, frame_output, BatteryLevel, HciState, HomeLight, InputMode, InputReport,
    OutputType, PacketCounter, PlayerLights, Rumble, SensorFrame, SimpleInput, StandardState,
    SubcommandId, HAT_USAGE, NEUTRAL_RUMBLE,
};
use crate::sensor::{self, MotionSample};
use crate::stick::{self, Stick, StickDirection, StickReading};
use crate::subcommand::{Dispatch, Request, Resolved, SubcommandQueue};
use crate::variant::{Button, ButtonSet, ControllerVariant, HatMapping, VariantDescriptor};

pub const COLOR_PRESENCE_ADDRESS: u32 = 0x601B;
pub const COLOR_BLOCK_ADDRESS: u32 = 0x6050;
pub const COLOR_BLOCK_LEN: u8 = 12;

/// Consecutive zero battery readings tolerated before reporting `Empty`
pub const EMPTY_BATTERY_DEBOUNCE: u32 = 100;

/// Channel a caller waits on for a subcommand outcome
pub type ReplySender = oneshot::Sender<Option<Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    fn from_slice(bytes: &[u8]) -> Self {
        Rgb(bytes[0], bytes[1], bytes[2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControllerColors {
    pub body: Rgb,
    pub buttons: Rgb,
    pub left_grip: Option<Rgb>,
    pub right_grip: Option<Rgb>,
}

impl Default for ControllerColors {
    fn default() -> Self {
        Self {
            body: Rgb(0x55, 0x55, 0x55),
            buttons: Rgb(0xFF, 0xFF, 0xFF),
            left_grip: None,
            right_grip: None,
        }
    }
}

impl ControllerColors {
    /// Decode the 12-byte color block; grips are only read when `grips` is set
    pub fn decode(bytes: &[u8], grips: bool) -> Option<Self> {
        if bytes.len() < COLOR_BLOCK_LEN as usize {
            return None;
        }
        Some(Self {
            body: Rgb::from_slice(&bytes[0..3]),
            buttons: Rgb::from_slice(&bytes[3..6]),
            left_grip: grips.then(|| Rgb::from_slice(&bytes[6..9])),
            right_grip: grips.then(|| Rgb::from_slice(&bytes[9..12])),
        })
    }
}

/// Who receives the outcome of a subcommand
#[derive(Debug)]
pub enum Responder {
    Discard,
    /// Route through the pending flash table for this address
    Flash(u32),
    External(ReplySender),
}

/// Reader waiting for a flash address
#[derive(Debug)]
pub enum FlashTarget {
    ColorPresence,
    ColorBlock,
    StickFactory(Stick),
    StickParameters(Stick),
    StickUser(Stick),
    ImuFactory,
    AccelOffset,
    ImuUser,
    External(ReplySender),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Colors,
    Calibration { remaining: usize },
    Ready,
    Closed,
}

/// Serializable view of a controller's current state
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub device: DeviceId,
    pub variant: ControllerVariant,
    pub serial: String,
    pub connection_type: ConnectionType,
    pub connected: bool,
    pub battery: BatteryLevel,
    pub charging: bool,
    pub buttons: ButtonSet,
    pub left_stick: Option<StickReading>,
    pub left_direction: StickDirection,
    pub right_stick: Option<StickReading>,
    pub right_direction: StickDirection,
    pub motion: Option<MotionSample>,
    pub colors: Option<ControllerColors>,
}

fn stick_index(stick: Stick) -> usize {
    match stick {
        Stick::Left => 0,
        Stick::Right => 1,
    }
}

pub struct Controller {
    info: DeviceInfo,
    variant: ControllerVariant,
    descriptor: &'static VariantDescriptor,
    writer: Box<dyn ReportWriter>,
    counter: PacketCounter,
    rumble: [u8; 8],
    phase: Phase,
    ready_signal: bool,
    queue: SubcommandQueue<Responder>,
    flash: PendingReads<FlashTarget>,
    calibration: CalibrationStore,
    colors: Option<ControllerColors>,
    buttons: ButtonSet,
    sticks: [Option<StickReading>; 2],
    directions: [StickDirection; 2],
    motion: Option<MotionSample>,
    battery: BatteryLevel,
    charging: bool,
    empty_readings: u32,
    outbox: Vec<InputEvent>,
}

impl Controller {
    /// `counter` continues whatever counter was used to identify the device
    pub fn new(
        info: DeviceInfo,
        variant: ControllerVariant,
        writer: Box<dyn ReportWriter>,
        counter: PacketCounter,
    ) -> Self {
        Self {
            info,
            variant,
            descriptor: variant.descriptor(),
            writer,
            counter,
            rumble: NEUTRAL_RUMBLE,
            phase: Phase::Colors,
            ready_signal: false,
            queue: SubcommandQueue::new(),
            flash: PendingReads::new(),
            calibration: CalibrationStore::new(),
            colors: None,
            buttons: ButtonSet::default(),
            sticks: [None, None],
            directions: [StickDirection::Neutral; 2],
            motion: None,
            battery: BatteryLevel::Unknown,
            charging: false,
            empty_readings: 0,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn variant(&self) -> ControllerVariant {
        self.variant
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    pub fn in_flight_seq(&self) -> Option<u64> {
        self.queue.in_flight_seq()
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.calibration
    }

    /// Begin the initialization reads
    pub fn start(&mut self) {
        debug!("Initializing {} ({})", self.variant, self.info.id);
        self.read_internal(COLOR_PRESENCE_ADDRESS, 1, FlashTarget::ColorPresence);
    }

    /// True once after initialization completes
    pub fn take_ready(&mut self) -> bool {
        std::mem::take(&mut self.ready_signal)
    }

    pub fn take_events(&mut self) -> Vec<InputEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Cleanup on disconnect or stop; outstanding requests are abandoned
    pub fn close(&mut self) {
        let abandoned = self.queue.queued() + usize::from(self.queue.in_flight_seq().is_some());
        if abandoned > 0 {
            debug!("Abandoning {} subcommand(s) for {}", abandoned, self.info.id);
        }
        self.queue.clear();
        self.flash.clear();
        self.phase = Phase::Closed;
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            device: self.info.id,
            variant: self.variant,
            serial: self.info.serial.clone(),
            connection_type: self.info.connection_type,
            connected: self.phase != Phase::Closed,
            battery: self.battery,
            charging: self.charging,
            buttons: self.buttons,
            left_stick: self.sticks[0],
            left_direction: self.directions[0],
            right_stick: self.sticks[1],
            right_direction: self.directions[1],
            motion: self.motion,
            colors: self.colors,
        }
    }

    // --- Input ---------------------------------------------------------

    pub fn handle_report(&mut self, report: &[u8]) {
        let Some(parsed) = InputReport::parse(report) else {
            trace!("Ignoring report {:02x?} from {}", report.first(), self.info.id);
            return;
        };
        let ready = self.is_ready();
        match parsed {
            InputReport::Simple(inputs) => {
                if ready {
                    self.apply_simple(&inputs);
                }
            }
            InputReport::Command { state, reply } => {
                let acked = reply.is_ack();
                if let Some(resolved) = self.queue.resolve(&reply) {
                    self.finish(resolved);
                    let next = self.queue.advance();
                    self.send_dispatch(next);
                }
                if acked && ready {
                    self.apply_state(&state);
                }
            }
            InputReport::Full { state, frames, .. } => {
                if ready {
                    self.apply_state(&state);
                    self.apply_motion(&frames);
                }
            }
        }
    }

    /// Deadline for subcommand `seq` passed
    pub fn expire(&mut self, seq: u64) {
        if let Some(resolved) = self.queue.expire(seq) {
            self.finish(resolved);
            let next = self.queue.advance();
            self.send_dispatch(next);
        }
    }

    fn set_button(&mut self, button: Button, pressed: bool) {
        if self.buttons.contains(button) == pressed {
            return;
        }
        self.buttons.set(button, pressed);
        self.outbox.push(if pressed {
            InputEvent::ButtonPressed { button }
        } else {
            InputEvent::ButtonReleased { button }
        });
    }

    fn set_direction(&mut self, stick: Stick, direction: StickDirection) {
        let slot = &mut self.directions[stick_index(stick)];
        if *slot == direction {
            return;
        }
        let previous = std::mem::replace(slot, direction);
        self.outbox.push(InputEvent::StickDirectionChanged {
            stick,
            direction,
            previous,
        });
    }

    fn apply_simple(&mut self, inputs: &[SimpleInput]) {
        let descriptor = self.descriptor;
        for input in inputs {
            if input.usage == HAT_USAGE {
                match &descriptor.hat {
                    HatMapping::Stick(stick, table) => {
                        let direction = table
                            .get(input.value as usize)
                            .copied()
                            .unwrap_or(StickDirection::Neutral);
                        self.set_direction(*stick, direction);
                    }
                    HatMapping::DPad => {
                        for (button, pressed) in HatMapping::dpad_buttons(input.value) {
                            self.set_button(button, pressed);
                        }
                    }
                }
            } else if let Some(button) = descriptor.button_for_usage(input.usage) {
                self.set_button(button, input.value != 0);
            }
        }
    }

    fn apply_state(&mut self, state: &StandardState) {
        self.update_battery(state);
        let descriptor = self.descriptor;
        for (button, pressed) in descriptor.decode_buttons(state.buttons) {
            self.set_button(button, pressed);
        }
        for (stick, raw) in [(Stick::Left, state.left_stick), (Stick::Right, state.right_stick)] {
            if descriptor.has_stick(stick) {
                self.apply_stick(stick, raw);
            }
        }
    }

    /// Sticks without any calibration report nothing
    fn apply_stick(&mut self, stick: Stick, raw: (u16, u16)) {
        let Some(calibration) = self.calibration.stick(stick) else {
            return;
        };
        let reading = stick::process(raw, &calibration);
        self.sticks[stick_index(stick)] = Some(reading);
        self.set_direction(stick, reading.direction);
        self.outbox.push(InputEvent::StickMoved { stick, reading });
    }

    fn apply_motion(&mut self, frames: &[SensorFrame]) {
        if !self.descriptor.imu {
            return;
        }
        let accel = self.calibration.accel();
        let gyro = self.calibration.gyro();
        for frame in frames {
            let sample = sensor::convert(frame, accel.as_ref(), gyro.as_ref());
            self.motion = Some(sample);
            self.outbox.push(InputEvent::Motion { sample });
        }
    }

    fn update_battery(&mut self, state: &StandardState) {
        let level = BatteryLevel::from_bits(state.battery_bits());
        if level == BatteryLevel::Empty {
            self.empty_readings += 1;
            if self.empty_readings <= EMPTY_BATTERY_DEBOUNCE {
                return;
            }
        } else {
            self.empty_readings = 0;
            let charging = state.is_charging();
            if charging != self.charging {
                self.charging = charging;
                self.outbox.push(InputEvent::ChargingChanged { charging });
            }
        }
        if level != self.battery {
            let previous = std::mem::replace(&mut self.battery, level);
            debug!("{} battery {:?} -> {:?}", self.info.id, previous, level);
            self.outbox.push(InputEvent::BatteryChanged { level, previous });
        }
    }

    // --- Subcommand plumbing ---------------------------------------------

    fn submit(&mut self, request: Request<Responder>) {
        let dispatch = self.queue.enqueue(request);
        self.send_dispatch(dispatch);
    }

    /// Write a dispatched request; a failed write resolves it at once
    fn send_dispatch(&mut self, mut dispatch: Option<Dispatch>) {
        while let Some(d) = dispatch.take() {
            let report = encode_subcommand(&mut self.counter, &self.rumble, d.id, &d.args);
            trace!("{} <- {:02x?}", self.info.id, report);
            match self.writer.write_report(&report) {
                Ok(()) => return,
                Err(e) => {
                    warn!("Failed to send {:?} to {}: {}", d.id, self.info.id, e);
                    if let Some(resolved) = self.queue.expire(d.seq) {
                        self.finish(resolved);
                    }
                    dispatch = self.queue.advance();
                }
            }
        }
    }

    fn finish(&mut self, resolved: Resolved<Responder>) {
        match resolved.responder {
            Responder::Discard => {}
            Responder::External(reply) => {
                // receiver may have given up waiting
                let _ = reply.send(resolved.data);
            }
            Responder::Flash(address) => self.finish_flash(address, resolved.data),
        }
    }

    fn finish_flash(&mut self, address: u32, data: Option<Vec<u8>>) {
        let Some(target) = self.flash.take(address) else {
            return;
        };
        let chunk = data.as_deref().and_then(FlashChunk::decode).map(|c| c.data);
        if chunk.is_none() {
            debug!("Flash read at {:#06x} on {} returned no data", address, self.info.id);
        }
        match target {
            FlashTarget::External(reply) => {
                let _ = reply.send(chunk);
            }
            target => self.apply_flash(target, chunk),
        }
    }

    fn read_internal(&mut self, address: u32, length: u8, target: FlashTarget) {
        self.flash.register(address, target);
        self.submit(flash::read_request(address, length, Responder::Flash(address)));
    }

    fn apply_flash(&mut self, target: FlashTarget, data: Option<Vec<u8>>) {
        let data = data.unwrap_or_default();
        match target {
            FlashTarget::ColorPresence => {
                if data.first().copied().unwrap_or(0) == 0 {
                    self.colors = Some(ControllerColors::default());
                    self.begin_calibration();
                } else {
                    self.read_internal(COLOR_BLOCK_ADDRESS, COLOR_BLOCK_LEN, FlashTarget::ColorBlock);
                }
            }
            FlashTarget::ColorBlock => {
                let colors = ControllerColors::decode(&data, self.descriptor.grip_colors)
                    .unwrap_or_default();
                debug!("{} colors: {:?}", self.info.id, colors);
                self.colors = Some(colors);
                self.begin_calibration();
            }
            FlashTarget::StickFactory(stick) => {
                self.calibration.load_stick_factory(stick, &data);
                self.calibration_step_done();
            }
            FlashTarget::StickParameters(stick) => {
                self.calibration.load_stick_parameters(stick, &data);
                self.calibration_step_done();
            }
            FlashTarget::StickUser(stick) => {
                self.calibration.load_stick_user(stick, &data);
                self.calibration_step_done();
            }
            FlashTarget::ImuFactory => {
                self.calibration.load_imu_factory(&data);
                self.calibration_step_done();
            }
            FlashTarget::AccelOffset => {
                self.calibration.load_accel_offset(&data);
                self.calibration_step_done();
            }
            FlashTarget::ImuUser => {
                self.calibration.load_imu_user(&data);
                self.calibration_step_done();
            }
            FlashTarget::External(_) => {}
        }
    }

    fn calibration_reads(&self) -> Vec<(u32, u8, FlashTarget)> {
        let mut reads = Vec::new();
        let sticks = [
            (Stick::Left, LEFT_STICK_FACTORY_ADDRESS, LEFT_STICK_PARAMETERS_ADDRESS, LEFT_STICK_USER_ADDRESS),
            (Stick::Right, RIGHT_STICK_FACTORY_ADDRESS, RIGHT_STICK_PARAMETERS_ADDRESS, RIGHT_STICK_USER_ADDRESS),
        ];
        for (stick, factory, parameters, user) in sticks {
            if self.descriptor.has_stick(stick) {
                reads.push((factory, STICK_FACTORY_LEN, FlashTarget::StickFactory(stick)));
                reads.push((parameters, STICK_PARAMETERS_LEN, FlashTarget::StickParameters(stick)));
                reads.push((user, STICK_USER_LEN, FlashTarget::StickUser(stick)));
            }
        }
        if self.descriptor.imu {
            reads.push((IMU_FACTORY_ADDRESS, IMU_FACTORY_LEN, FlashTarget::ImuFactory));
            reads.push((ACCEL_OFFSET_ADDRESS, ACCEL_OFFSET_LEN, FlashTarget::AccelOffset));
            reads.push((IMU_USER_ADDRESS, IMU_USER_LEN, FlashTarget::ImuUser));
        }
        reads
    }

    fn begin_calibration(&mut self) {
        if !self.descriptor.has_calibration() {
            self.mark_ready();
            return;
        }
        let reads = self.calibration_reads();
        self.phase = Phase::Calibration {
            remaining: reads.len(),
        };
        for (address, length, target) in reads {
            self.read_internal(address, length, target);
        }
    }

    fn calibration_step_done(&mut self) {
        if let Phase::Calibration { remaining } = &mut self.phase {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.mark_ready();
            }
        }
    }

    fn mark_ready(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Ready;
        self.ready_signal = true;
        info!("{} ({}) ready", self.variant, self.info.serial);
    }

    // --- Commands ------------------------------------------------------

    fn responder(reply: Option<ReplySender>) -> Responder {
        reply.map_or(Responder::Discard, Responder::External)
    }

    fn require(&self, supported: bool, feature: &'static str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(JoyConError::Unsupported {
                variant: self.variant,
                feature,
            })
        }
    }

    /// Send a rumble-only report and keep the state for later subcommands
    pub fn send_rumble(&mut self, rumble: &Rumble) -> Result<()> {
        self.rumble = rumble.encode();
        let report = frame_output(OutputType::Rumble, &mut self.counter, &self.rumble);
        self.writer.write_report(&report)
    }

    pub fn send_subcommand(&mut self, id: SubcommandId, args: Vec<u8>, reply: Option<ReplySender>) {
        self.submit(Request::new(id, args, Self::responder(reply)));
    }

    pub fn set_hci_state(&mut self, state: HciState, reply: Option<ReplySender>) {
        self.send_subcommand(SubcommandId::SetHciState, vec![state as u8], reply);
    }

    pub fn set_input_mode(&mut self, mode: InputMode, reply: Option<ReplySender>) {
        self.send_subcommand(SubcommandId::SetInputMode, vec![mode as u8], reply);
    }

    pub fn set_player_lights(&mut self, lights: PlayerLights, reply: Option<ReplySender>) {
        self.send_subcommand(SubcommandId::SetPlayerLights, vec![lights.encode()], reply);
    }

    pub fn set_home_light(&mut self, pattern: &HomeLight, reply: Option<ReplySender>) -> Result<()> {
        self.require(self.descriptor.home_led, "HOME light")?;
        self.send_subcommand(SubcommandId::SetHomeLight, pattern.encode(), reply);
        Ok(())
    }

    pub fn enable_imu(&mut self, enabled: bool, reply: Option<ReplySender>) -> Result<()> {
        self.require(self.descriptor.imu, "motion sensors")?;
        self.send_subcommand(SubcommandId::EnableImu, vec![enabled as u8], reply);
        Ok(())
    }

    pub fn enable_vibration(&mut self, enabled: bool, reply: Option<ReplySender>) {
        self.send_subcommand(SubcommandId::EnableVibration, vec![enabled as u8], reply);
    }

    pub fn read_flash(&mut self, address: u32, length: u8, reply: ReplySender) -> Result<()> {
        if length == 0 || length > flash::MAX_READ_LEN {
            return Err(JoyConError::InvalidArgument(format!(
                "flash read length must be 1..={}",
                flash::MAX_READ_LEN
            )));
        }
        self.read_internal(address, length, FlashTarget::External(reply));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::calibration::tests::pack_nibble_values;
    use crate::device::testing::{info, RecordingWriter};
    use crate::protocol::{encode_stick, PRO_CONTROLLER_PRODUCT_ID, SNES_CONTROLLER_PRODUCT_ID};

    /// Command reply report: neutral state followed by ack, id and data
    pub fn reply_report(subcommand: u8, ack: bool, data: &[u8]) -> Vec<u8> {
        let mut report = vec![0x21, 0x00, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        report.push(if ack { 0x80 } else { 0x00 });
        report.push(subcommand);
        report.extend_from_slice(data);
        report
    }

    /// Flash read reply for `address`
    pub fn flash_reply(address: u32, data: &[u8]) -> Vec<u8> {
        let mut payload = address.to_le_bytes().to_vec();
        payload.push(data.len() as u8);
        payload.extend_from_slice(data);
        reply_report(SubcommandId::ReadSpiFlash as u8, true, &payload)
    }

    /// (address, length) of a flash-read subcommand report
    pub fn flash_request(report: &[u8]) -> Option<(u32, u8)> {
        if report.len() < 16 || report[0] != 0x01 || report[10] != SubcommandId::ReadSpiFlash as u8 {
            return None;
        }
        let address = u32::from_le_bytes([report[11], report[12], report[13], report[14]]);
        Some((address, report[15]))
    }

    /// Answer every flash read the controller writes until it stops asking
    fn answer_reads(controller: &mut Controller, writer: &RecordingWriter, flash: &HashMap<u32, Vec<u8>>) {
        loop {
            let reports = writer.taken();
            if reports.is_empty() {
                break;
            }
            for report in reports {
                if let Some((address, length)) = flash_request(&report) {
                    let data = flash
                        .get(&address)
                        .cloned()
                        .unwrap_or_else(|| vec![0; length as usize]);
                    controller.handle_report(&flash_reply(address, &data));
                }
            }
        }
    }

    fn pro_flash() -> HashMap<u32, Vec<u8>> {
        let mut flash = HashMap::new();
        flash.insert(COLOR_PRESENCE_ADDRESS, vec![1]);
        flash.insert(
            COLOR_BLOCK_ADDRESS,
            vec![0x32, 0x32, 0x32, 0xFF, 0xFF, 0xFF, 0x0A, 0xB9, 0xE6, 0xFF, 0x3C, 0x28],
        );
        flash.insert(
            LEFT_STICK_FACTORY_ADDRESS,
            pack_nibble_values([1000, 1000, 2000, 2000, 1000, 1000]).to_vec(),
        );
        flash.insert(
            RIGHT_STICK_FACTORY_ADDRESS,
            pack_nibble_values([2000, 2000, 1000, 1000, 1000, 1000]).to_vec(),
        );
        flash
    }

    fn ready_pro() -> (Controller, RecordingWriter) {
        let writer = RecordingWriter::default();
        let mut controller = Controller::new(
            info(1, PRO_CONTROLLER_PRODUCT_ID),
            ControllerVariant::FullGamepad,
            Box::new(writer.clone()),
            PacketCounter::default(),
        );
        controller.start();
        answer_reads(&mut controller, &writer, &pro_flash());
        assert!(controller.take_ready());
        (controller, writer)
    }

    fn full_report(buttons: [u8; 3], left: (u16, u16), right: (u16, u16)) -> Vec<u8> {
        let mut report = vec![0x30, 0x00, 0x80];
        report.extend_from_slice(&buttons);
        report.extend_from_slice(&encode_stick(left.0, left.1));
        report.extend_from_slice(&encode_stick(right.0, right.1));
        report.push(0x00);
        report.extend_from_slice(&[0u8; 36]);
        report
    }

    #[test]
    fn test_initialization_reads_colors_then_calibration() {
        let writer = RecordingWriter::default();
        let mut controller = Controller::new(
            info(1, PRO_CONTROLLER_PRODUCT_ID),
            ControllerVariant::FullGamepad,
            Box::new(writer.clone()),
            PacketCounter::default(),
        );
        controller.start();
        let first = writer.taken();
        assert_eq!(first.len(), 1);
        assert_eq!(flash_request(&first[0]), Some((COLOR_PRESENCE_ADDRESS, 1)));
        assert_eq!(&first[0][2..10], &NEUTRAL_RUMBLE);
        assert_eq!(controller.phase(), Phase::Colors);

        controller.handle_report(&flash_reply(COLOR_PRESENCE_ADDRESS, &[0]));
        assert_eq!(controller.phase(), Phase::Calibration { remaining: 9 });
        // only one read is on the wire at a time
        let next = writer.taken();
        assert_eq!(next.len(), 1);
        assert_eq!(flash_request(&next[0]), Some((LEFT_STICK_FACTORY_ADDRESS, 9)));
        assert_eq!(controller.snapshot().colors, Some(ControllerColors::default()));
        assert!(!controller.take_ready());
    }

    #[test]
    fn test_colors_with_grips() {
        let (controller, _) = ready_pro();
        let colors = controller.snapshot().colors.unwrap();
        assert_eq!(colors.body, Rgb(0x32, 0x32, 0x32));
        assert_eq!(colors.left_grip, Some(Rgb(0x0A, 0xB9, 0xE6)));
        assert_eq!(colors.right_grip, Some(Rgb(0xFF, 0x3C, 0x28)));
    }

    #[test]
    fn test_legacy_variant_skips_calibration() {
        let writer = RecordingWriter::default();
        let mut controller = Controller::new(
            info(2, SNES_CONTROLLER_PRODUCT_ID),
            ControllerVariant::LegacySnes,
            Box::new(writer.clone()),
            PacketCounter::default(),
        );
        controller.start();
        writer.taken();
        controller.handle_report(&flash_reply(COLOR_PRESENCE_ADDRESS, &[0]));
        assert!(controller.take_ready());
        assert_eq!(writer.count(), 0);
    }

    #[test]
    fn test_timeouts_still_finish_initialization() {
        let writer = RecordingWriter::default();
        let mut controller = Controller::new(
            info(1, PRO_CONTROLLER_PRODUCT_ID),
            ControllerVariant::FullGamepad,
            Box::new(writer.clone()),
            PacketCounter::default(),
        );
        controller.start();
        for _ in 0..10 {
            let seq = controller.in_flight_seq().unwrap();
            controller.expire(seq);
        }
        assert!(controller.take_ready());
        assert!(controller.calibration().stick(Stick::Left).is_none());
    }

    #[test]
    fn test_stray_nack_keeps_calibration_read_outstanding() {
        let writer = RecordingWriter::default();
        let mut controller = Controller::new(
            info(1, PRO_CONTROLLER_PRODUCT_ID),
            ControllerVariant::FullGamepad,
            Box::new(writer.clone()),
            PacketCounter::default(),
        );
        controller.start();
        writer.taken();
        controller.handle_report(&flash_reply(COLOR_PRESENCE_ADDRESS, &[0]));
        let reads = writer.taken();
        assert_eq!(flash_request(&reads[0]), Some((LEFT_STICK_FACTORY_ADDRESS, STICK_FACTORY_LEN)));

        controller.handle_report(&reply_report(SubcommandId::ReadSpiFlash as u8, false, &[]));
        assert_eq!(writer.count(), 0);

        let blob = pack_nibble_values([1000, 1000, 2000, 2000, 1000, 1000]);
        controller.handle_report(&flash_reply(LEFT_STICK_FACTORY_ADDRESS, &blob));
        assert!(controller.calibration().stick(Stick::Left).is_some());
        let next = writer.taken();
        assert_eq!(
            flash_request(&next[0]),
            Some((LEFT_STICK_PARAMETERS_ADDRESS, STICK_PARAMETERS_LEN))
        );
    }

    #[test]
    fn test_uncalibrated_stick_is_not_reported() {
        let writer = RecordingWriter::default();
        let mut controller = Controller::new(
            info(1, PRO_CONTROLLER_PRODUCT_ID),
            ControllerVariant::FullGamepad,
            Box::new(writer),
            PacketCounter::default(),
        );
        controller.start();
        while let Some(seq) = controller.in_flight_seq() {
            controller.expire(seq);
        }
        assert!(controller.take_ready());
        controller.take_events();

        controller.handle_report(&full_report([0x08, 0, 0], (2048, 2048), (3000, 1000)));
        let snapshot = controller.snapshot();
        assert!(snapshot.left_stick.is_none());
        assert!(snapshot.right_stick.is_none());
        assert_eq!(snapshot.left_direction, StickDirection::Neutral);
        let events = controller.take_events();
        assert!(!events.iter().any(|e| matches!(
            e,
            InputEvent::StickMoved { .. } | InputEvent::StickDirectionChanged { .. }
        )));
        // buttons still come through
        assert!(events.contains(&InputEvent::ButtonPressed { button: Button::A }));
    }

    #[test]
    fn test_full_report_end_to_end() {
        let (mut controller, _) = ready_pro();
        // A + R on byte 0, Minus on byte 1, Up + ZL on byte 2
        let report = full_report([0x48, 0x01, 0x82], (2500, 2000), (2000, 1000));
        controller.handle_report(&report);

        let snapshot = controller.snapshot();
        let mut pressed: Vec<Button> = snapshot.buttons.iter().collect();
        pressed.sort();
        let mut expected = vec![Button::A, Button::R, Button::Minus, Button::Up, Button::ZL];
        expected.sort();
        assert_eq!(pressed, expected);

        let left = snapshot.left_stick.unwrap();
        assert!((left.position.x - 0.5).abs() < 1e-6);
        assert!(left.position.y.abs() < 1e-6);
        assert_eq!(left.direction, StickDirection::Right);
        let right = snapshot.right_stick.unwrap();
        assert!((right.position.y + 1.0).abs() < 1e-6);
        assert_eq!(snapshot.right_direction, StickDirection::Down);

        let events = controller.take_events();
        let presses = events
            .iter()
            .filter(|e| matches!(e, InputEvent::ButtonPressed { .. }))
            .count();
        assert_eq!(presses, 5);
        let motion = events
            .iter()
            .filter(|e| matches!(e, InputEvent::Motion { .. }))
            .count();
        assert_eq!(motion, 3);
        assert!(events.contains(&InputEvent::BatteryChanged {
            level: BatteryLevel::Full,
            previous: BatteryLevel::Unknown,
        }));
    }

    #[test]
    fn test_held_button_fires_once() {
        let (mut controller, _) = ready_pro();
        let report = full_report([0x08, 0, 0], (2000, 2000), (2000, 2000));
        controller.handle_report(&report);
        controller.take_events();
        controller.handle_report(&report);
        let events = controller.take_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, InputEvent::ButtonPressed { .. } | InputEvent::ButtonReleased { .. })));
        // position is reported every time even when unchanged
        let moves = events
            .iter()
            .filter(|e| matches!(e, InputEvent::StickMoved { .. }))
            .count();
        assert_eq!(moves, 2);

        controller.handle_report(&full_report([0, 0, 0], (2000, 2000), (2000, 2000)));
        assert!(controller
            .take_events()
            .contains(&InputEvent::ButtonReleased { button: Button::A }));
    }

    #[test]
    fn test_battery_empty_is_debounced() {
        let (mut controller, _) = ready_pro();
        controller.handle_report(&full_report([0; 3], (2000, 2000), (2000, 2000)));
        controller.take_events();

        let mut empty = full_report([0; 3], (2000, 2000), (2000, 2000));
        empty[2] = 0x00;
        for _ in 0..EMPTY_BATTERY_DEBOUNCE {
            controller.handle_report(&empty);
        }
        assert_eq!(controller.snapshot().battery, BatteryLevel::Full);
        controller.take_events();
        controller.handle_report(&empty);
        assert!(controller.take_events().contains(&InputEvent::BatteryChanged {
            level: BatteryLevel::Empty,
            previous: BatteryLevel::Full,
        }));
    }

    #[test]
    fn test_charging_change() {
        let (mut controller, _) = ready_pro();
        let mut report = full_report([0; 3], (2000, 2000), (2000, 2000));
        report[2] = 0x90;
        controller.handle_report(&report);
        assert!(controller
            .take_events()
            .contains(&InputEvent::ChargingChanged { charging: true }));
    }

    #[test]
    fn test_simple_report_dpad_hat() {
        let (mut controller, _) = ready_pro();
        // usage 2 (A) pressed, hat 1 = up-right
        controller.handle_report(&[0x3F, 0x02, 0x00, 0x01]);
        let snapshot = controller.snapshot();
        assert!(snapshot.buttons.contains(Button::A));
        assert!(snapshot.buttons.contains(Button::Up));
        assert!(snapshot.buttons.contains(Button::Right));
        assert!(!snapshot.buttons.contains(Button::Down));
    }

    #[test]
    fn test_reports_before_ready_are_not_applied() {
        let writer = RecordingWriter::default();
        let mut controller = Controller::new(
            info(1, PRO_CONTROLLER_PRODUCT_ID),
            ControllerVariant::FullGamepad,
            Box::new(writer),
            PacketCounter::default(),
        );
        controller.start();
        controller.handle_report(&full_report([0x08, 0, 0], (2000, 2000), (2000, 2000)));
        assert!(controller.take_events().is_empty());
    }

    #[test]
    fn test_counter_shared_by_rumble_and_subcommands() {
        let (mut controller, writer) = ready_pro();
        controller.send_rumble(&Rumble::off()).unwrap();
        controller.set_player_lights(PlayerLights::from_pattern("1000").unwrap(), None);
        let reports = writer.taken();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0][0], 0x10);
        assert_eq!(reports[1][0], 0x01);
        assert_eq!(reports[1][1], (reports[0][1] + 1) & 0x0F);
        assert_eq!(reports[1][10], SubcommandId::SetPlayerLights as u8);
    }

    #[test]
    fn test_external_flash_read() {
        let (mut controller, writer) = ready_pro();
        let (tx, mut rx) = oneshot::channel();
        controller.read_flash(0x6000, 16, tx).unwrap();
        let report = writer.taken().pop().unwrap();
        assert_eq!(flash_request(&report), Some((0x6000, 16)));
        controller.handle_report(&flash_reply(0x6000, &[0xAB; 16]));
        assert_eq!(rx.try_recv().unwrap(), Some(vec![0xAB; 16]));
    }

    #[test]
    fn test_timed_out_flash_read_yields_no_data() {
        let (mut controller, writer) = ready_pro();
        let (tx, mut rx) = oneshot::channel();
        controller.read_flash(0x6000, 4, tx).unwrap();
        writer.taken();
        // a NACK cannot say which read it answers, so the deadline decides
        controller.handle_report(&reply_report(SubcommandId::ReadSpiFlash as u8, false, &[]));
        assert!(rx.try_recv().is_err());
        let seq = controller.in_flight_seq().unwrap();
        controller.expire(seq);
        assert_eq!(rx.try_recv().unwrap(), None);
        // a late reply has nowhere to go
        controller.handle_report(&flash_reply(0x6000, &[1, 2, 3, 4]));
        assert!(controller.in_flight_seq().is_none());
    }

    #[test]
    fn test_unsupported_commands() {
        let writer = RecordingWriter::default();
        let mut controller = Controller::new(
            info(3, SNES_CONTROLLER_PRODUCT_ID),
            ControllerVariant::LegacySnes,
            Box::new(writer),
            PacketCounter::default(),
        );
        assert!(matches!(
            controller.enable_imu(true, None),
            Err(JoyConError::Unsupported { .. })
        ));
        assert!(controller.set_home_light(&HomeLight::default(), None).is_err());
        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            controller.read_flash(0x6000, 0, tx),
            Err(JoyConError::InvalidArgument(_))
        ));
    }
}
