//! Driver for the eight channel analog input board.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::device::{Controller, DeviceHandle, DeviceModel, Function};
use crate::frame::{DataUnit, Pdu, RegisterKind};
use crate::master::RtuMaster;
use crate::{lock, regs};

const READ_DATA_VALUES: Function    = Function::Custom(0x0201);
const READ_CHANNEL_TYPES: Function  = Function::Custom(0x0202);
const WRITE_CHANNEL_TYPES: Function = Function::Custom(0x0203);
const WRITE_CHANNEL_TYPE: Function  = Function::Custom(0x0204);

const CHANNEL_COUNT: usize = 8;
const DEFAULT_ADDRESS: u8 = 1;
const DEFAULT_INTERVAL_MS: u32 = 1000;

/// Measurement range of one analog input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelType {
    #[default]
    Volt0To5 = 0,
    Volt1To5 = 1,
    Current0To20 = 2,
    Current4To20 = 3,
    /// Unscaled converter code, 0..4096.
    Raw = 4,
}

impl ChannelType {
    fn from_register(value: u16) -> ChannelType {
        match value {
            0 => ChannelType::Volt0To5,
            1 => ChannelType::Volt1To5,
            2 => ChannelType::Current0To20,
            3 => ChannelType::Current4To20,
            4 => ChannelType::Raw,
            other => {
                log::warn!("WMBADC: unknown channel type {}, assuming 0-5 V", other);
                ChannelType::Volt0To5
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdcEvent {
    /// A sample arrived. The register reading is passed on verbatim;
    /// conversion to engineering units is up to the consumer.
    ValueChanged { channel: u8, value: f32 },
    ChannelChanged { channel: u8, channel_type: ChannelType },
}

#[doc(hidden)]
pub enum AdcCommand {
    SetChannelType { channel: u8, channel_type: ChannelType, update_device: bool },
    SetChannelTypes { types: Vec<ChannelType>, update_device: bool },
    Subscribe(Sender<AdcEvent>),
}

#[derive(Debug, Default)]
struct AdcState {
    values: [f32; CHANNEL_COUNT],
    types: [ChannelType; CHANNEL_COUNT],
}

struct AdcModel {
    state: Arc<Mutex<AdcState>>,
    events: Vec<Sender<AdcEvent>>,
}

impl AdcModel {
    fn emit(&mut self, event: AdcEvent) {
        self.events.retain(|sender| sender.send(event).is_ok());
    }
}

impl DeviceModel for AdcModel {
    type Command = AdcCommand;

    fn id(&self) -> &'static str {
        "WMBADC:"
    }

    fn max_inputs(&self) -> u8 {
        CHANNEL_COUNT as u8
    }

    fn max_outputs(&self) -> u8 {
        0
    }

    fn on_open(&mut self, ctl: &mut Controller) {
        ctl.schedule(READ_CHANNEL_TYPES);
        ctl.schedule(READ_DATA_VALUES);
    }

    fn on_poll(&mut self, ctl: &mut Controller) {
        ctl.schedule(READ_DATA_VALUES);
    }

    fn on_function(&mut self, ctl: &mut Controller, function: Function) {
        match function {
            READ_DATA_VALUES => {
                log::debug!("{} read data values", ctl.id());
                ctl.send(READ_DATA_VALUES, Pdu::read_request(
                    RegisterKind::InputRegisters, regs::ADC_VALUE_BASE,
                    CHANNEL_COUNT as u16));
            }
            READ_CHANNEL_TYPES => {
                log::debug!("{} read channel types", ctl.id());
                ctl.send(READ_CHANNEL_TYPES, Pdu::read_request(
                    RegisterKind::HoldingRegisters, regs::ADC_CHANNEL_TYPE_BASE,
                    CHANNEL_COUNT as u16));
            }
            _ => {}
        }
    }

    fn on_command(&mut self, ctl: &mut Controller, command: AdcCommand) {
        match command {
            AdcCommand::SetChannelType { channel, channel_type, update_device } => {
                log::debug!("{} set channel type: {} {:?}", ctl.id(), channel, channel_type);
                if channel >= self.max_inputs() {
                    log::error!("{} invalid channel number: {}", ctl.id(), channel);
                    return;
                }
                lock(&self.state).types[channel as usize] = channel_type;
                if update_device {
                    ctl.send(WRITE_CHANNEL_TYPE, Pdu::write_single_register(
                        regs::ADC_CHANNEL_TYPE_BASE + channel as u16, channel_type as u16));
                }
                self.emit(AdcEvent::ChannelChanged { channel, channel_type });
            }
            AdcCommand::SetChannelTypes { types, update_device } => {
                log::debug!("{} set channel types, update: {}", ctl.id(), update_device);
                if types.len() != self.max_inputs() as usize {
                    log::error!("{} invalid number of channel types: {}",
                        ctl.id(), types.len());
                    return;
                }
                {
                    let mut state = lock(&self.state);
                    for (slot, &channel_type) in state.types.iter_mut().zip(types.iter()) {
                        *slot = channel_type;
                    }
                }
                if update_device {
                    let values: Vec<u16> =
                        types.iter().map(|&channel_type| channel_type as u16).collect();
                    ctl.send(WRITE_CHANNEL_TYPES, Pdu::write_multiple_registers(
                        regs::ADC_CHANNEL_TYPE_BASE, &values));
                }
                for (channel, &channel_type) in types.iter().enumerate() {
                    self.emit(AdcEvent::ChannelChanged {
                        channel: channel as u8,
                        channel_type,
                    });
                }
            }
            AdcCommand::Subscribe(sender) => self.events.push(sender),
        }
    }

    fn on_input_registers(&mut self, ctl: &mut Controller, unit: &DataUnit) -> bool {
        if ctl.function() == READ_DATA_VALUES {
            if ctl.check_value_count(CHANNEL_COUNT, unit) {
                for channel in 0..CHANNEL_COUNT {
                    let value = unit.value(channel) as f32;
                    lock(&self.state).values[channel] = value;
                    self.emit(AdcEvent::ValueChanged { channel: channel as u8, value });
                }
                return true;
            }
        }
        false
    }

    fn on_holding_registers(&mut self, ctl: &mut Controller, unit: &DataUnit) -> bool {
        if ctl.function() == READ_CHANNEL_TYPES {
            if ctl.check_value_count(CHANNEL_COUNT, unit) {
                for channel in 0..CHANNEL_COUNT {
                    let channel_type = ChannelType::from_register(unit.value(channel));
                    lock(&self.state).types[channel] = channel_type;
                    self.emit(AdcEvent::ChannelChanged {
                        channel: channel as u8,
                        channel_type,
                    });
                }
                return true;
            }
        }
        false
    }
}

/// Analog input board front end.
pub struct AnalogDevice {
    device: DeviceHandle<AdcCommand>,
    state: Arc<Mutex<AdcState>>,
}

impl AnalogDevice {
    pub fn new(master: &RtuMaster) -> AnalogDevice {
        let state = Arc::new(Mutex::new(AdcState::default()));
        let model = AdcModel { state: state.clone(), events: Vec::new() };
        let device = DeviceHandle::start(model, master, DEFAULT_ADDRESS, DEFAULT_INTERVAL_MS);
        AnalogDevice { device, state }
    }

    pub fn set_channel_type(&self, channel: u8, channel_type: ChannelType, update_device: bool) {
        self.device.command(AdcCommand::SetChannelType { channel, channel_type, update_device });
    }

    pub fn set_channel_types(&self, types: &[ChannelType], update_device: bool) {
        self.device.command(AdcCommand::SetChannelTypes {
            types: types.to_vec(),
            update_device,
        });
    }

    pub fn channel_value(&self, channel: u8) -> f32 {
        lock(&self.state).values.get(channel as usize).copied().unwrap_or(0.0)
    }

    pub fn channel_type(&self, channel: u8) -> ChannelType {
        lock(&self.state).types.get(channel as usize).copied().unwrap_or_default()
    }

    /// Sample and channel type change notifications.
    pub fn subscribe(&self) -> Receiver<AdcEvent> {
        let (sender, receiver) = mpsc::channel();
        self.device.command(AdcCommand::Subscribe(sender));
        receiver
    }
}

impl std::ops::Deref for AnalogDevice {
    type Target = DeviceHandle<AdcCommand>;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}
