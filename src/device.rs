//! Driver kernel shared by the board front ends: per-device function
//! queue, periodic status polling, and reply dispatch by register kind.
//!
//! Each device runs one runtime thread that multiplexes master events, API
//! commands and the poll timer over a single channel, so all driver state
//! has exactly one writer. The master event stream is shared by every
//! device on the bus; the runtime filters by server address and by whether
//! it is awaiting a reply.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{BaudRate, DataBits, Parity, StopBits};
use crate::frame::{DataUnit, Pdu, RegisterKind};
use crate::master::{RtuMaster, TransportEvent};
use crate::{lock, regs};

/// Poll period while the post-open queries drain; the timer switches to
/// the device's own interval after the first top-up.
const INITIAL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Function {
    /// Idle: no reply outstanding, the next queued function may dispatch.
    #[default]
    Unspecified,
    ReadVersion,
    ReadDeviceAddress,
    WriteDeviceAddress,
    WriteUartParams,
    /// Device specific function, tag internal to its driver.
    Custom(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Opened,
    Closed,
    AddressChanged(u8),
    IntervalChanged(u32),
    Complete(Function),
}

pub(crate) enum BaseCommand {
    Open,
    Close,
    Schedule(Function),
    SetAddress { address: u8, update_device: bool },
    SetBaudRate { rate: BaudRate, update_device: bool },
    SetParity { parity: Parity, update_device: bool },
    SetInterval(u32),
    Subscribe(Sender<DeviceEvent>),
    Shutdown,
}

pub(crate) enum Msg<C> {
    Transport(TransportEvent),
    Base(BaseCommand),
    Command(C),
}

#[derive(Debug)]
struct BaseState {
    address: u8,
    firmware_version: u16,
    interval_ms: u32,
}

/// Per-device bookkeeping handed to the model hooks: the master handle,
/// the pending function queue and the function a reply is awaited for.
pub struct Controller {
    id: &'static str,
    master: RtuMaster,
    state: Arc<Mutex<BaseState>>,
    function: Function,
    queue: VecDeque<Function>,
    events: Vec<Sender<DeviceEvent>>,
    poll: PollTimer,
}

impl Controller {
    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn device_address(&self) -> u8 {
        lock(&self.state).address
    }

    /// The function a reply is currently awaited for.
    pub fn function(&self) -> Function {
        self.function
    }

    /// Appends a function to the pending queue; the poll timer drains it
    /// one entry at a time.
    pub fn schedule(&mut self, function: Function) {
        self.queue.push_back(function);
    }

    /// Issues a raw request to the device and marks `function` as awaiting
    /// its reply.
    pub fn send(&mut self, function: Function, pdu: Pdu) {
        self.function = function;
        self.master.send(self.device_address(), pdu);
    }

    pub fn read(&mut self, function: Function, unit: DataUnit) {
        self.function = function;
        self.master.read(self.device_address(), unit);
    }

    pub fn write(&mut self, function: Function, unit: DataUnit) {
        self.function = function;
        self.master.write(self.device_address(), unit);
    }

    pub fn check_value_count(&self, count: usize, unit: &DataUnit) -> bool {
        if unit.value_count() != count {
            log::warn!("{} invalid number of values in function {:?}: {}",
                self.id, self.function, unit.value_count());
            return false;
        }
        true
    }

    fn emit(&mut self, event: DeviceEvent) {
        self.events.retain(|sender| sender.send(event).is_ok());
    }

    fn read_version(&mut self) {
        log::debug!("{} read version", self.id);
        self.send(Function::ReadVersion,
            Pdu::read_request(RegisterKind::HoldingRegisters, regs::REG_FIRMWARE_VERSION, 1));
    }

    fn read_device_address(&mut self) {
        log::debug!("{} read device address", self.id);
        self.send(Function::ReadDeviceAddress,
            Pdu::read_request(RegisterKind::HoldingRegisters, regs::REG_DEVICE_ADDRESS, 1));
    }

    fn set_device_address(&mut self, address: u8, update_device: bool) {
        if self.device_address() == address {
            return;
        }
        if !(1..=247).contains(&address) {
            log::error!("{} invalid device address: {}", self.id, address);
            return;
        }
        if !update_device {
            lock(&self.state).address = address;
            self.emit(DeviceEvent::AddressChanged(address));
            return;
        }
        log::debug!("{} set device address: {}", self.id, address);
        // issued to the old address; local state follows once the device
        // acknowledges
        self.send(Function::WriteDeviceAddress,
            Pdu::write_single_register(regs::REG_DEVICE_ADDRESS, address as u16));
    }

    fn set_device_uart(&mut self, rate: BaudRate, parity: Parity) {
        let Some(parity_code) = parity.uart_code() else {
            log::warn!("{} unsupported UART parity: {:?}", self.id, parity);
            return;
        };
        log::debug!("{} set device UART parameters: {:?} {:?}", self.id, rate, parity);
        let value = ((parity_code as u16) << 8) | rate.uart_code() as u16;
        self.send(Function::WriteUartParams,
            Pdu::write_single_register(regs::REG_UART_CONFIG, value));
        // the device switches as soon as it has answered; follow it on our
        // side so subsequent requests use the new framing
        self.master.set_baud_rate(rate);
        self.master.set_parity(parity);
    }
}

struct PollTimer {
    deadline: Option<Instant>,
    period: Duration,
}

impl PollTimer {
    fn new() -> PollTimer {
        PollTimer { deadline: None, period: INITIAL_POLL }
    }

    fn start(&mut self, period: Duration) {
        self.period = period;
        self.deadline = Some(Instant::now() + period);
    }

    fn rearm(&mut self) {
        if self.deadline.is_some() {
            self.deadline = Some(Instant::now() + self.period);
        }
    }

    fn set_period(&mut self, period: Duration) {
        if self.period != period {
            self.period = period;
            self.deadline = Some(Instant::now() + period);
        }
    }

    fn stop(&mut self) {
        self.deadline = None;
    }
}

/// The hooks a concrete board driver implements on top of the kernel.
pub trait DeviceModel: Send + 'static {
    type Command: Send + 'static;

    /// Trace prefix for this device kind.
    fn id(&self) -> &'static str;
    fn max_inputs(&self) -> u8;
    fn max_outputs(&self) -> u8;

    /// Schedule the initial queries for this device kind.
    fn on_open(&mut self, ctl: &mut Controller);
    /// Top up the periodic reads once the queue has drained.
    fn on_poll(&mut self, ctl: &mut Controller);
    /// Translate a queued function id into a transport request.
    fn on_function(&mut self, ctl: &mut Controller, function: Function);
    fn on_command(&mut self, ctl: &mut Controller, command: Self::Command);

    fn on_coils(&mut self, _ctl: &mut Controller, _unit: &DataUnit) -> bool {
        false
    }
    fn on_discrete_inputs(&mut self, _ctl: &mut Controller, _unit: &DataUnit) -> bool {
        false
    }
    fn on_input_registers(&mut self, _ctl: &mut Controller, _unit: &DataUnit) -> bool {
        false
    }
    fn on_holding_registers(&mut self, _ctl: &mut Controller, _unit: &DataUnit) -> bool {
        false
    }
}

/// Front end plumbing shared by the concrete drivers. Dropping the handle
/// stops the runtime thread and detaches it from the master; an in-flight
/// request is not cancelled, its reply is simply discarded.
pub struct DeviceHandle<C: Send + 'static> {
    inbox: Sender<Msg<C>>,
    state: Arc<Mutex<BaseState>>,
    master: RtuMaster,
}

impl<C: Send + 'static> DeviceHandle<C> {
    /// Spawns the runtime thread for `model` and attaches it to the
    /// master's event stream.
    pub fn start<M>(model: M, master: &RtuMaster, address: u8, interval_ms: u32)
        -> DeviceHandle<C>
    where
        M: DeviceModel<Command = C>,
    {
        let state = Arc::new(Mutex::new(BaseState {
            address,
            firmware_version: 0,
            interval_ms,
        }));
        let (inbox, messages) = mpsc::channel::<Msg<C>>();
        let forward = inbox.clone();
        master.attach(move |event| forward.send(Msg::Transport(event.clone())).is_ok());
        let ctl = Controller {
            id: model.id(),
            master: master.clone(),
            state: state.clone(),
            function: Function::Unspecified,
            queue: VecDeque::new(),
            events: Vec::new(),
            poll: PollTimer::new(),
        };
        let runtime = Runtime { model, ctl, messages, running: true };
        thread::spawn(move || runtime.run());
        DeviceHandle { inbox, state, master: master.clone() }
    }

    fn base(&self, command: BaseCommand) {
        let _ = self.inbox.send(Msg::Base(command));
    }

    /// Forwards a driver specific command to the runtime thread.
    pub fn command(&self, command: C) {
        let _ = self.inbox.send(Msg::Command(command));
    }

    /// Opens the master if it is not open yet and starts the status polls.
    pub fn open(&self) {
        self.base(BaseCommand::Open);
    }

    /// Stops the status polls and closes the master.
    pub fn close(&self) {
        self.base(BaseCommand::Close);
    }

    pub fn schedule_function(&self, function: Function) {
        self.base(BaseCommand::Schedule(function));
    }

    pub fn device_address(&self) -> u8 {
        lock(&self.state).address
    }

    /// Changes the device address. With `update_device` the new address is
    /// also written to the vendor register on the wire.
    pub fn set_device_address(&self, address: u8, update_device: bool) {
        self.base(BaseCommand::SetAddress { address, update_device });
    }

    pub fn firmware_version(&self) -> u16 {
        lock(&self.state).firmware_version
    }

    pub fn poll_interval(&self) -> u32 {
        lock(&self.state).interval_ms
    }

    pub fn set_poll_interval(&self, interval_ms: u32) {
        self.base(BaseCommand::SetInterval(interval_ms));
    }

    pub fn port_name(&self) -> String {
        self.master.port_name()
    }

    pub fn set_port_name(&self, name: &str) {
        self.master.set_port_name(name);
    }

    pub fn baud_rate(&self) -> BaudRate {
        self.master.baud_rate()
    }

    /// Changes the line speed. With `update_device` the vendor UART
    /// register is rewritten first so the device follows.
    pub fn set_baud_rate(&self, rate: BaudRate, update_device: bool) {
        self.base(BaseCommand::SetBaudRate { rate, update_device });
    }

    pub fn parity(&self) -> Parity {
        self.master.parity()
    }

    pub fn set_parity(&self, parity: Parity, update_device: bool) {
        self.base(BaseCommand::SetParity { parity, update_device });
    }

    pub fn data_bits(&self) -> DataBits {
        self.master.data_bits()
    }

    pub fn set_data_bits(&self, bits: DataBits) {
        self.master.set_data_bits(bits);
    }

    pub fn stop_bits(&self) -> StopBits {
        self.master.stop_bits()
    }

    pub fn set_stop_bits(&self, bits: StopBits) {
        self.master.set_stop_bits(bits);
    }

    pub fn is_valid_modbus(&self) -> bool {
        self.master.is_open()
    }

    /// Base device events: open/close, address and interval changes, and
    /// one `Complete` per finished function.
    pub fn subscribe_device(&self) -> Receiver<DeviceEvent> {
        let (sender, receiver) = mpsc::channel();
        self.base(BaseCommand::Subscribe(sender));
        receiver
    }
}

impl<C: Send + 'static> Drop for DeviceHandle<C> {
    fn drop(&mut self) {
        self.base(BaseCommand::Shutdown);
    }
}

struct Runtime<M: DeviceModel> {
    model: M,
    ctl: Controller,
    messages: Receiver<Msg<M::Command>>,
    running: bool,
}

impl<M: DeviceModel> Runtime<M> {
    fn run(mut self) {
        log::debug!("{} device runtime started", self.ctl.id);
        while self.running {
            let message = match self.ctl.poll.deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match self.messages.recv_timeout(timeout) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            self.tick();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.messages.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            match message {
                Msg::Transport(event) => self.on_transport(event),
                Msg::Base(command) => self.on_base(command),
                Msg::Command(command) => self.model.on_command(&mut self.ctl, command),
            }
        }
        log::debug!("{} device runtime stopped", self.ctl.id);
    }

    /// One poll timer tick: dispatch the next queued function, and once the
    /// queue drains let the model schedule its periodic reads, switching the
    /// timer from the initial rate to the device interval.
    fn tick(&mut self) {
        self.ctl.poll.rearm();
        if self.ctl.queue.is_empty() || self.ctl.function != Function::Unspecified {
            return;
        }
        if !self.ctl.master.is_open() {
            self.ctl.poll.stop();
            self.ctl.queue.clear();
            return;
        }
        match self.ctl.queue.pop_front().unwrap_or_default() {
            Function::ReadVersion => self.ctl.read_version(),
            Function::ReadDeviceAddress => self.ctl.read_device_address(),
            function => self.model.on_function(&mut self.ctl, function),
        }
        if self.ctl.queue.is_empty() {
            self.model.on_poll(&mut self.ctl);
            if self.ctl.queue.is_empty() {
                self.ctl.poll.stop();
            } else {
                let interval_ms = lock(&self.ctl.state).interval_ms;
                self.ctl.poll.set_period(Duration::from_millis(interval_ms as u64));
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.opened(),
            TransportEvent::Closed => self.closed(),
            TransportEvent::Error { server, kind, message } => {
                if server != self.ctl.device_address()
                        || self.ctl.function == Function::Unspecified {
                    return;
                }
                log::error!("{} modbus error: {:?} {}", self.ctl.id, kind, message);
                self.ctl.poll.stop();
            }
            TransportEvent::Received { server, response, unit } => {
                if server != self.ctl.device_address()
                        || self.ctl.function == Function::Unspecified {
                    return;
                }
                let Some(unit) = unit else {
                    if response.is_exception() {
                        log::warn!("{} exception response in function {:?}: code {:#04x}",
                            self.ctl.id, self.ctl.function, response.exception_code());
                    }
                    return;
                };
                self.dispatch_unit(&unit);
            }
            TransportEvent::Complete { server } => {
                if server != self.ctl.device_address()
                        || self.ctl.function == Function::Unspecified {
                    return;
                }
                let function = self.ctl.function;
                self.ctl.emit(DeviceEvent::Complete(function));
                self.ctl.function = Function::Unspecified;
            }
        }
    }

    fn dispatch_unit(&mut self, unit: &DataUnit) {
        let handled = match unit.kind {
            RegisterKind::Coils =>
                self.model.on_coils(&mut self.ctl, unit),
            RegisterKind::DiscreteInputs =>
                self.model.on_discrete_inputs(&mut self.ctl, unit),
            RegisterKind::InputRegisters =>
                self.model.on_input_registers(&mut self.ctl, unit)
                    || self.base_input_registers(unit),
            RegisterKind::HoldingRegisters =>
                self.model.on_holding_registers(&mut self.ctl, unit)
                    || self.base_holding_registers(unit),
        };
        if !handled {
            log::warn!("{} unhandled data unit in function {:?}: {:?}",
                self.ctl.id, self.ctl.function, unit.kind);
        }
    }

    /// Write echoes the base understands: the device address write.
    fn base_input_registers(&mut self, unit: &DataUnit) -> bool {
        if self.ctl.function == Function::WriteDeviceAddress {
            if self.ctl.check_value_count(2, unit)
                    && unit.value(0) == regs::REG_DEVICE_ADDRESS {
                self.ctl.set_device_address(unit.value(1) as u8, false);
            }
            return true;
        }
        false
    }

    fn base_holding_registers(&mut self, unit: &DataUnit) -> bool {
        match self.ctl.function {
            Function::ReadDeviceAddress => {
                if self.ctl.check_value_count(1, unit) {
                    self.ctl.set_device_address(unit.value(0) as u8, false);
                }
                true
            }
            Function::ReadVersion => {
                if self.ctl.check_value_count(1, unit) {
                    lock(&self.ctl.state).firmware_version = unit.value(0);
                }
                true
            }
            _ => false,
        }
    }

    fn opened(&mut self) {
        log::debug!("{} modbus opened", self.ctl.id);
        self.ctl.function = Function::Unspecified;
        self.ctl.queue.clear();
        self.ctl.schedule(Function::ReadVersion);
        self.ctl.schedule(Function::ReadDeviceAddress);
        self.model.on_open(&mut self.ctl);
        self.ctl.poll.start(INITIAL_POLL);
        self.ctl.emit(DeviceEvent::Opened);
    }

    fn closed(&mut self) {
        log::debug!("{} modbus closed", self.ctl.id);
        self.ctl.poll.stop();
        self.ctl.queue.clear();
        self.ctl.emit(DeviceEvent::Closed);
    }

    fn on_base(&mut self, command: BaseCommand) {
        match command {
            BaseCommand::Open => {
                if self.ctl.master.is_open() {
                    self.opened();
                } else {
                    self.ctl.master.open();
                }
            }
            BaseCommand::Close => {
                self.ctl.poll.stop();
                if self.ctl.master.is_open() {
                    self.ctl.master.close();
                } else {
                    self.closed();
                }
            }
            BaseCommand::Schedule(function) => self.ctl.schedule(function),
            BaseCommand::SetAddress { address, update_device } =>
                self.ctl.set_device_address(address, update_device),
            BaseCommand::SetBaudRate { rate, update_device } => {
                if self.ctl.master.baud_rate() != rate {
                    if update_device {
                        self.ctl.set_device_uart(rate, self.ctl.master.parity());
                    } else {
                        self.ctl.master.set_baud_rate(rate);
                    }
                }
            }
            BaseCommand::SetParity { parity, update_device } => {
                if self.ctl.master.parity() != parity {
                    if update_device {
                        self.ctl.set_device_uart(self.ctl.master.baud_rate(), parity);
                    } else {
                        self.ctl.master.set_parity(parity);
                    }
                }
            }
            BaseCommand::SetInterval(interval_ms) => {
                let changed = {
                    let mut state = lock(&self.ctl.state);
                    let changed = state.interval_ms != interval_ms;
                    state.interval_ms = interval_ms;
                    changed
                };
                if changed {
                    self.ctl.emit(DeviceEvent::IntervalChanged(interval_ms));
                }
            }
            BaseCommand::Subscribe(sender) => self.ctl.events.push(sender),
            BaseCommand::Shutdown => self.running = false,
        }
    }
}
