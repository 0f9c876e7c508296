//! Vendor register map shared by the Waveshare Modbus RTU boards.

#![allow(dead_code)]

/// UART configuration register; parity code in the high byte, baud rate
/// code in the low byte.
pub const REG_UART_CONFIG: u16 = 0x2000;

/// Device Modbus address register; address in the low byte.
pub const REG_DEVICE_ADDRESS: u16 = 0x4000;

/// Firmware version register, read-only.
pub const REG_FIRMWARE_VERSION: u16 = 0x8000;

/// First relay coil; coils 0..=7 map to relays 0..=7.
pub const RELAY_COIL_BASE: u16 = 0x0000;

/// Writing this coil address drives every relay at once.
pub const RELAY_COIL_ALL: u16 = 0x00FF;

/// First relay control mode holding register, one per relay.
pub const RELAY_CONTROL_MODE_BASE: u16 = 0x1000;

/// Flash-on interval, one coil per relay, value in 100 ms units.
pub const RELAY_FLASH_ON_BASE: u16 = 0x0200;

/// Flash-off interval, one coil per relay, value in 100 ms units.
pub const RELAY_FLASH_OFF_BASE: u16 = 0x0400;

/// First analog input data register.
pub const ADC_VALUE_BASE: u16 = 0x0000;

/// First analog channel type holding register, one per channel.
pub const ADC_CHANNEL_TYPE_BASE: u16 = 0x1000;
