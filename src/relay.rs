//! Driver for the eight channel relay / digital input board.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::device::{Controller, DeviceHandle, DeviceModel, Function};
use crate::frame::{DataUnit, Pdu, RegisterKind};
use crate::master::RtuMaster;
use crate::{lock, regs};

const UPDATE_RELAY: Function        = Function::Custom(0x0101);
const READ_RELAY_STATUS: Function   = Function::Custom(0x0102);
const READ_DIGITAL_INPUT: Function  = Function::Custom(0x0103);
const WRITE_RELAY_STATUS: Function  = Function::Custom(0x0104);
const WRITE_RELAY_MASK: Function    = Function::Custom(0x0105);
const READ_CONTROL_MODE: Function   = Function::Custom(0x0106);
const WRITE_CONTROL_MODE: Function  = Function::Custom(0x0107);
const WRITE_CONTROL_MODES: Function = Function::Custom(0x0108);
const SET_FLASH_ON: Function        = Function::Custom(0x0109);
const SET_FLASH_OFF: Function       = Function::Custom(0x0110);

const RELAY_COUNT: usize = 8;
const DEFAULT_ADDRESS: u8 = 3;
const DEFAULT_INTERVAL_MS: u32 = 2000;

/// How a relay reacts to its matching digital input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// Driven by commands only.
    #[default]
    Normal = 0,
    /// Relay follows the digital input.
    Linkage = 1,
    /// Each input pulse toggles the relay.
    Toggle = 2,
}

impl ControlMode {
    fn from_register(value: u16) -> ControlMode {
        match value {
            0 => ControlMode::Normal,
            1 => ControlMode::Linkage,
            2 => ControlMode::Toggle,
            other => {
                log::warn!("WRELAY: unknown control mode {}, assuming normal", other);
                ControlMode::Normal
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    RelayChanged { relay: u8, state: bool },
    InputChanged { input: u8, state: bool },
    ModeChanged { relay: u8, mode: ControlMode },
}

#[doc(hidden)]
pub enum RelayCommand {
    SetRelay { relay: u8, state: bool },
    SetAllRelays { mask: u8 },
    SetControlMode { relay: u8, mode: ControlMode, update_device: bool },
    SetControlModes { modes: Vec<ControlMode>, update_device: bool },
    SetFlashInterval { relay: u8, mode: FlashMode, interval_100ms: u8 },
    Subscribe(Sender<RelayEvent>),
}

#[derive(Debug, Default)]
struct RelayState {
    relays: [bool; RELAY_COUNT],
    inputs: [bool; RELAY_COUNT],
    modes: [ControlMode; RELAY_COUNT],
}

struct RelayModel {
    state: Arc<Mutex<RelayState>>,
    events: Vec<Sender<RelayEvent>>,
    /// Mask of the relay write in flight. The device echo confirms only
    /// the coil count, so the per-relay state is reconstructed from here.
    pending_mask: Option<u8>,
}

impl RelayModel {
    fn emit(&mut self, event: RelayEvent) {
        self.events.retain(|sender| sender.send(event).is_ok());
    }

    fn set_relay(&mut self, relay: usize, state: bool) {
        if relay >= RELAY_COUNT {
            return;
        }
        lock(&self.state).relays[relay] = state;
        self.emit(RelayEvent::RelayChanged { relay: relay as u8, state });
    }
}

impl DeviceModel for RelayModel {
    type Command = RelayCommand;

    fn id(&self) -> &'static str {
        "WRELAY:"
    }

    fn max_inputs(&self) -> u8 {
        RELAY_COUNT as u8
    }

    fn max_outputs(&self) -> u8 {
        RELAY_COUNT as u8
    }

    fn on_open(&mut self, ctl: &mut Controller) {
        ctl.schedule(READ_CONTROL_MODE);
        ctl.schedule(READ_RELAY_STATUS);
        ctl.schedule(READ_DIGITAL_INPUT);
    }

    fn on_poll(&mut self, ctl: &mut Controller) {
        // inputs before relays, so input changes surface ahead of their
        // linkage mode consequences
        ctl.schedule(READ_DIGITAL_INPUT);
        ctl.schedule(READ_RELAY_STATUS);
    }

    fn on_function(&mut self, ctl: &mut Controller, function: Function) {
        match function {
            READ_RELAY_STATUS => {
                log::debug!("{} read relay status", ctl.id());
                ctl.send(READ_RELAY_STATUS, Pdu::read_request(
                    RegisterKind::Coils, regs::RELAY_COIL_BASE, RELAY_COUNT as u16));
            }
            READ_DIGITAL_INPUT => {
                log::debug!("{} read digital inputs", ctl.id());
                ctl.send(READ_DIGITAL_INPUT, Pdu::read_request(
                    RegisterKind::DiscreteInputs, 0x0000, RELAY_COUNT as u16));
            }
            READ_CONTROL_MODE => {
                log::debug!("{} read control modes", ctl.id());
                ctl.send(READ_CONTROL_MODE, Pdu::read_request(
                    RegisterKind::HoldingRegisters, regs::RELAY_CONTROL_MODE_BASE,
                    RELAY_COUNT as u16));
            }
            _ => {}
        }
    }

    fn on_command(&mut self, ctl: &mut Controller, command: RelayCommand) {
        match command {
            RelayCommand::SetRelay { relay, state } => {
                log::debug!("{} set relay: {} {}", ctl.id(), relay, state);
                let all = relay as u16 == regs::RELAY_COIL_ALL;
                if !all && relay >= self.max_outputs() {
                    log::error!("{} invalid relay number: {}", ctl.id(), relay);
                    return;
                }
                let function = if all { WRITE_RELAY_STATUS } else { UPDATE_RELAY };
                ctl.send(function, Pdu::write_single_coil(relay as u16, state));
            }
            RelayCommand::SetAllRelays { mask } => {
                log::debug!("{} set relay mask: {:#04x}", ctl.id(), mask);
                if self.pending_mask.replace(mask).is_some() {
                    // two mask writes in flight would break the echo
                    // accounting; the one-in-flight gate makes this a bug
                    log::error!("{} relay mask write already pending", ctl.id());
                }
                ctl.send(WRITE_RELAY_MASK, Pdu::write_multiple_coils(
                    regs::RELAY_COIL_BASE, RELAY_COUNT as u16, &[mask]));
            }
            RelayCommand::SetControlMode { relay, mode, update_device } => {
                log::debug!("{} set control mode: {} {:?}", ctl.id(), relay, mode);
                if relay >= self.max_outputs() {
                    log::error!("{} invalid relay number: {}", ctl.id(), relay);
                    return;
                }
                lock(&self.state).modes[relay as usize] = mode;
                if update_device {
                    ctl.send(WRITE_CONTROL_MODE, Pdu::write_single_register(
                        regs::RELAY_CONTROL_MODE_BASE + relay as u16, mode as u16));
                }
                self.emit(RelayEvent::ModeChanged { relay, mode });
            }
            RelayCommand::SetControlModes { modes, update_device } => {
                log::debug!("{} set control modes, update: {}", ctl.id(), update_device);
                if modes.len() != self.max_outputs() as usize {
                    log::error!("{} invalid number of control modes: {}",
                        ctl.id(), modes.len());
                    return;
                }
                {
                    let mut state = lock(&self.state);
                    for (slot, &mode) in state.modes.iter_mut().zip(modes.iter()) {
                        *slot = mode;
                    }
                }
                if update_device {
                    let values: Vec<u16> = modes.iter().map(|&mode| mode as u16).collect();
                    ctl.send(WRITE_CONTROL_MODES, Pdu::write_multiple_registers(
                        regs::RELAY_CONTROL_MODE_BASE, &values));
                }
                for (relay, &mode) in modes.iter().enumerate() {
                    self.emit(RelayEvent::ModeChanged { relay: relay as u8, mode });
                }
            }
            RelayCommand::SetFlashInterval { relay, mode, interval_100ms } => {
                log::debug!("{} set flash {:?} interval: {} x100ms", ctl.id(), mode, interval_100ms);
                if relay >= self.max_outputs() {
                    log::error!("{} invalid relay number: {}", ctl.id(), relay);
                    return;
                }
                let (function, base) = match mode {
                    FlashMode::On  => (SET_FLASH_ON, regs::RELAY_FLASH_ON_BASE),
                    FlashMode::Off => (SET_FLASH_OFF, regs::RELAY_FLASH_OFF_BASE),
                };
                ctl.send(function, Pdu::write_single_coil_value(
                    base + relay as u16, interval_100ms as u16));
            }
            RelayCommand::Subscribe(sender) => self.events.push(sender),
        }
    }

    fn on_coils(&mut self, ctl: &mut Controller, unit: &DataUnit) -> bool {
        if ctl.function() == READ_RELAY_STATUS {
            for relay in 0..unit.value_count().min(RELAY_COUNT) {
                self.set_relay(relay, unit.value(relay) == 1);
            }
            return true;
        }
        false
    }

    fn on_discrete_inputs(&mut self, ctl: &mut Controller, unit: &DataUnit) -> bool {
        if ctl.function() == READ_DIGITAL_INPUT {
            for input in 0..unit.value_count().min(RELAY_COUNT) {
                let state = unit.value(input) == 1;
                lock(&self.state).inputs[input] = state;
                self.emit(RelayEvent::InputChanged { input: input as u8, state });
            }
            return true;
        }
        false
    }

    fn on_input_registers(&mut self, ctl: &mut Controller, unit: &DataUnit) -> bool {
        match ctl.function() {
            UPDATE_RELAY => {
                // single coil write echo: coil address, then drive value
                if ctl.check_value_count(2, unit) {
                    self.set_relay(unit.value(0) as usize, unit.value(1) != 0);
                    return true;
                }
                false
            }
            WRITE_RELAY_STATUS => {
                // the all-relays coil was written; every output follows
                if ctl.check_value_count(2, unit) {
                    let state = unit.value(1) != 0;
                    for relay in 0..RELAY_COUNT {
                        self.set_relay(relay, state);
                    }
                    return true;
                }
                false
            }
            WRITE_RELAY_MASK => {
                // the echo confirms the count only; rebuild from the mask
                if ctl.check_value_count(2, unit) {
                    if let Some(mask) = self.pending_mask.take() {
                        for relay in 0..RELAY_COUNT {
                            self.set_relay(relay, mask & (1 << relay) != 0);
                        }
                        return true;
                    }
                }
                false
            }
            SET_FLASH_ON | SET_FLASH_OFF => true,
            _ => false,
        }
    }

    fn on_holding_registers(&mut self, ctl: &mut Controller, unit: &DataUnit) -> bool {
        if ctl.function() == READ_CONTROL_MODE {
            if ctl.check_value_count(RELAY_COUNT, unit) {
                for relay in 0..RELAY_COUNT {
                    let mode = ControlMode::from_register(unit.value(relay));
                    lock(&self.state).modes[relay] = mode;
                    self.emit(RelayEvent::ModeChanged { relay: relay as u8, mode });
                }
                return true;
            }
        }
        false
    }
}

/// Relay / digital input board front end.
///
/// While a relay is in a mode other than `Normal` the device may ignore
/// manual relay writes; the driver forwards them regardless.
pub struct RelayDevice {
    device: DeviceHandle<RelayCommand>,
    state: Arc<Mutex<RelayState>>,
}

impl RelayDevice {
    pub fn new(master: &RtuMaster) -> RelayDevice {
        let state = Arc::new(Mutex::new(RelayState::default()));
        let model = RelayModel {
            state: state.clone(),
            events: Vec::new(),
            pending_mask: None,
        };
        let device = DeviceHandle::start(model, master, DEFAULT_ADDRESS, DEFAULT_INTERVAL_MS);
        RelayDevice { device, state }
    }

    /// Switches one relay, or every relay when `relay` is 0xFF.
    pub fn set_relay_status(&self, relay: u8, state: bool) {
        self.device.command(RelayCommand::SetRelay { relay, state });
    }

    /// Drives all eight relays from `mask`, bit k controlling relay k.
    pub fn set_all_relays(&self, mask: u8) {
        self.device.command(RelayCommand::SetAllRelays { mask });
    }

    pub fn set_control_mode(&self, relay: u8, mode: ControlMode, update_device: bool) {
        self.device.command(RelayCommand::SetControlMode { relay, mode, update_device });
    }

    pub fn set_control_modes(&self, modes: &[ControlMode], update_device: bool) {
        self.device.command(RelayCommand::SetControlModes {
            modes: modes.to_vec(),
            update_device,
        });
    }

    /// Programs the flash-on or flash-off interval of one relay, in
    /// 100 ms units.
    pub fn set_flash_interval(&self, relay: u8, mode: FlashMode, interval_100ms: u8) {
        self.device.command(RelayCommand::SetFlashInterval { relay, mode, interval_100ms });
    }

    pub fn relay_status(&self, relay: u8) -> bool {
        lock(&self.state).relays.get(relay as usize).copied().unwrap_or(false)
    }

    pub fn digital_input(&self, input: u8) -> bool {
        lock(&self.state).inputs.get(input as usize).copied().unwrap_or(false)
    }

    pub fn control_mode(&self, relay: u8) -> ControlMode {
        lock(&self.state).modes.get(relay as usize).copied().unwrap_or_default()
    }

    /// Relay, input and mode change notifications.
    pub fn subscribe(&self) -> Receiver<RelayEvent> {
        let (sender, receiver) = mpsc::channel();
        self.device.command(RelayCommand::Subscribe(sender));
        receiver
    }
}

impl std::ops::Deref for RelayDevice {
    type Target = DeviceHandle<RelayCommand>;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::frame::{function_codes as fc, Response};
    use crate::link::mock::{echo_script, MockLink};
    use crate::Result;

    /// Answers like an idle board at address 3: all relays off, inputs 0
    /// and 2 high, all control modes normal, firmware 0x012C.
    fn board_script(server: u8, pdu: &Pdu) -> Result<Response> {
        let address = u16::from_be_bytes([pdu.data[0], pdu.data[1]]);
        let data = match (pdu.function, address) {
            (fc::READ_HOLDING_REGISTERS, regs::REG_FIRMWARE_VERSION) =>
                vec![0x02, 0x01, 0x2C],
            (fc::READ_HOLDING_REGISTERS, regs::REG_DEVICE_ADDRESS) =>
                vec![0x02, 0x00, 0x03],
            (fc::READ_HOLDING_REGISTERS, regs::RELAY_CONTROL_MODE_BASE) => {
                let mut data = vec![16u8];
                data.extend_from_slice(&[0; 16]);
                data
            }
            (fc::READ_COILS, _) => vec![0x01, 0x00],
            (fc::READ_DISCRETE_INPUTS, _) => vec![0x01, 0b0000_0101],
            _ => return echo_script(server, pdu),
        };
        Ok(Response { function: pdu.function, data })
    }

    fn next(events: &Receiver<RelayEvent>) -> RelayEvent {
        events.recv_timeout(Duration::from_secs(2)).expect("no relay event")
    }

    fn opened_relay<F>(script: F) -> (RelayDevice, Receiver<RelayEvent>)
    where
        F: FnMut(u8, &Pdu) -> Result<Response> + Send + 'static,
    {
        let master = RtuMaster::with_link(MockLink::new(script));
        let relay = RelayDevice::new(&master);
        relay.set_poll_interval(60_000);
        let events = relay.subscribe();
        relay.open();
        (relay, events)
    }

    fn drain_initial(events: &Receiver<RelayEvent>) {
        for relay in 0..8 {
            assert_eq!(next(events),
                RelayEvent::ModeChanged { relay, mode: ControlMode::Normal });
        }
        for relay in 0..8 {
            assert_eq!(next(events), RelayEvent::RelayChanged { relay, state: false });
        }
        for input in 0..8 {
            let state = input == 0 || input == 2;
            assert_eq!(next(events), RelayEvent::InputChanged { input, state });
        }
    }

    #[test]
    fn test_open_reads_modes_relays_inputs() {
        let (relay, events) = opened_relay(board_script);
        drain_initial(&events);
        assert_eq!(relay.firmware_version(), 0x012C);
        assert_eq!(relay.device_address(), 3);
        assert!(!relay.relay_status(0));
        assert!(relay.digital_input(0));
        assert!(!relay.digital_input(1));
        assert_eq!(relay.control_mode(5), ControlMode::Normal);
    }

    #[test]
    fn test_set_relay_status() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let (relay, events) = opened_relay(move |server, pdu| {
            if pdu.function == fc::WRITE_SINGLE_COIL {
                lock(&seen).push((server, pdu.data.clone()));
            }
            board_script(server, pdu)
        });
        drain_initial(&events);

        relay.set_relay_status(2, true);
        assert_eq!(next(&events), RelayEvent::RelayChanged { relay: 2, state: true });
        assert!(relay.relay_status(2));
        assert_eq!(lock(&requests).as_slice(),
            &[(3, vec![0x00, 0x02, 0xFF, 0x00])]);
    }

    #[test]
    fn test_set_all_relays_mask() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let (relay, events) = opened_relay(move |server, pdu| {
            if pdu.function == fc::WRITE_MULTIPLE_COILS {
                lock(&seen).push(pdu.data.clone());
            }
            board_script(server, pdu)
        });
        drain_initial(&events);

        relay.set_all_relays(0x5A);
        // one event per relay in index order, from the stashed mask
        for relay_index in 0..8u8 {
            let state = 0x5A & (1 << relay_index) != 0;
            assert_eq!(next(&events),
                RelayEvent::RelayChanged { relay: relay_index, state });
        }
        assert!(relay.relay_status(1));
        assert!(!relay.relay_status(0));
        assert_eq!(lock(&requests).as_slice(),
            &[vec![0x00, 0x00, 0x00, 0x08, 0x01, 0x5A]]);
    }

    #[test]
    fn test_set_all_relays_via_broadcast_coil() {
        let (relay, events) = opened_relay(board_script);
        drain_initial(&events);

        relay.set_relay_status(0xFF, true);
        for relay_index in 0..8u8 {
            assert_eq!(next(&events),
                RelayEvent::RelayChanged { relay: relay_index, state: true });
        }
        assert!(relay.relay_status(7));
    }

    #[test]
    fn test_out_of_range_relay_rejected() {
        let (relay, events) = opened_relay(board_script);
        drain_initial(&events);

        relay.set_relay_status(8, true);
        relay.set_control_mode(9, ControlMode::Linkage, true);
        relay.set_control_modes(&[ControlMode::Normal; 3], true);
        // none of the rejected calls produced traffic or events
        relay.set_relay_status(0, true);
        assert_eq!(next(&events), RelayEvent::RelayChanged { relay: 0, state: true });
    }

    #[test]
    fn test_control_mode_writes_are_not_deduplicated() {
        let writes = Arc::new(Mutex::new(0u32));
        let seen = writes.clone();
        let (relay, events) = opened_relay(move |server, pdu| {
            if pdu.function == fc::WRITE_SINGLE_REGISTER
                    && pdu.data[..2] == [0x10, 0x01] {
                *lock(&seen) += 1;
            }
            board_script(server, pdu)
        });
        drain_initial(&events);

        relay.set_control_mode(1, ControlMode::Toggle, true);
        assert_eq!(next(&events),
            RelayEvent::ModeChanged { relay: 1, mode: ControlMode::Toggle });
        relay.set_control_mode(1, ControlMode::Toggle, true);
        assert_eq!(next(&events),
            RelayEvent::ModeChanged { relay: 1, mode: ControlMode::Toggle });
        // both writes reached the wire
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while *lock(&writes) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*lock(&writes), 2);
    }

    #[test]
    fn test_set_device_address_on_wire() {
        use crate::device::DeviceEvent;

        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let (relay, events) = opened_relay(move |server, pdu| {
            if pdu.function == fc::WRITE_SINGLE_REGISTER {
                lock(&seen).push((server, pdu.data.clone()));
            }
            board_script(server, pdu)
        });
        drain_initial(&events);
        let device_events = relay.subscribe_device();

        relay.set_device_address(5, true);
        let mut saw_address = false;
        let mut saw_complete = false;
        while !(saw_address && saw_complete) {
            match device_events.recv_timeout(Duration::from_secs(2)).expect("no device event") {
                DeviceEvent::AddressChanged(address) => {
                    assert_eq!(address, 5);
                    assert!(!saw_complete, "complete fired before the address update");
                    saw_address = true;
                }
                DeviceEvent::Complete(Function::WriteDeviceAddress) => saw_complete = true,
                // a straggling complete of the last status poll may cross
                // the subscription
                DeviceEvent::Complete(Function::Custom(_)) => {}
                event => panic!("unexpected device event: {:?}", event),
            }
        }
        assert_eq!(relay.device_address(), 5);
        // the write went to the old address, new address in the low byte
        assert_eq!(lock(&requests).as_slice(),
            &[(3, vec![0x40, 0x00, 0x00, 0x05])]);
    }

    #[test]
    fn test_set_device_uart_rewrites_vendor_register() {
        use crate::config::BaudRate;

        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let (relay, events) = opened_relay(move |server, pdu| {
            if pdu.function == fc::WRITE_SINGLE_REGISTER {
                lock(&seen).push(pdu.data.clone());
            }
            board_script(server, pdu)
        });
        drain_initial(&events);

        relay.set_baud_rate(BaudRate::Baud19200, true);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while lock(&requests).is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        // parity code in the high byte, baud code in the low byte
        assert_eq!(lock(&requests).as_slice(),
            &[vec![0x20, 0x00, 0x00, 0x02]]);
        // the local line configuration follows the device
        assert_eq!(relay.baud_rate(), BaudRate::Baud19200);
    }

    #[test]
    fn test_set_control_modes_bulk() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let (relay, events) = opened_relay(move |server, pdu| {
            if pdu.function == fc::WRITE_MULTIPLE_REGISTERS {
                lock(&seen).push(pdu.data.clone());
            }
            board_script(server, pdu)
        });
        drain_initial(&events);

        let mut modes = [ControlMode::Normal; 8];
        modes[2] = ControlMode::Linkage;
        relay.set_control_modes(&modes, true);
        for relay_index in 0..8u8 {
            let mode = if relay_index == 2 { ControlMode::Linkage } else { ControlMode::Normal };
            assert_eq!(next(&events),
                RelayEvent::ModeChanged { relay: relay_index, mode });
        }
        assert_eq!(relay.control_mode(2), ControlMode::Linkage);
        let requests = lock(&requests);
        assert_eq!(requests.len(), 1);
        // start 0x1000, eight registers, sixteen payload bytes
        assert_eq!(&requests[0][..5], &[0x10, 0x00, 0x00, 0x08, 0x10]);
        assert_eq!(&requests[0][5..11], &[0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);
    }
}
