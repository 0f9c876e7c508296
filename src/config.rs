//! Serial line configuration for the RS-485 link.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaudRate {
    Baud4800,
    #[default]
    Baud9600,
    Baud19200,
    Baud38400,
    Baud57600,
    Baud115200,
}

impl BaudRate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            Self::Baud4800   => 4800,
            Self::Baud9600   => 9600,
            Self::Baud19200  => 19200,
            Self::Baud38400  => 38400,
            Self::Baud57600  => 57600,
            Self::Baud115200 => 115200,
        }
    }

    /// Code written to the low byte of the vendor UART register.
    pub(crate) fn uart_code(self) -> u8 {
        match self {
            Self::Baud4800   => 0x00,
            Self::Baud9600   => 0x01,
            Self::Baud19200  => 0x02,
            Self::Baud38400  => 0x03,
            Self::Baud57600  => 0x04,
            Self::Baud115200 => 0x05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

impl Parity {
    /// Code written to the high byte of the vendor UART register. Mark and
    /// space parity exist on the host side only; the boards reject them.
    pub(crate) fn uart_code(self) -> Option<u8> {
        match self {
            Self::None => Some(0x00),
            Self::Even => Some(0x01),
            Self::Odd  => Some(0x02),
            Self::Mark | Self::Space => None,
        }
    }

    fn bits(self) -> u32 {
        match self {
            Self::None => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    fn bits(self) -> u32 {
        match self {
            Self::Five  => 5,
            Self::Six   => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    fn bits(self) -> u32 {
        match self {
            Self::One => 1,
            // 1.5 stop bits occupy the line as long as 2 for timing purposes
            Self::OnePointFive | Self::Two => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub port_name: String,
    pub baud_rate: BaudRate,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port_name: "ttyUSB0".to_string(),
            baud_rate: BaudRate::default(),
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            parity: Parity::default(),
        }
    }
}

impl SerialConfig {
    /// Duration of one character on the wire, including start bit, parity
    /// and stop bits.
    pub fn char_time(&self) -> Duration {
        let bits = 1 + self.data_bits.bits() + self.parity.bits() + self.stop_bits.bits();
        Duration::from_secs_f64(bits as f64 / self.baud_rate.bits_per_second() as f64)
    }

    /// Modbus RTU inter-frame silence (3.5 character times), with the
    /// standard 1750 us floor for rates above 19200 baud.
    pub fn inter_frame_gap(&self) -> Duration {
        if self.baud_rate.bits_per_second() > 19200 {
            Duration::from_micros(1750)
        } else {
            self.char_time() * 7 / 2
        }
    }
}
