//! Modbus RTU framing: CRC-16, PDU and ADU codecs, and translation of
//! response payloads into typed data units.

use crate::{Error, Result};

pub mod function_codes {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
    /// Set in the function code of an exception response.
    pub const EXCEPTION: u8 = 0x80;
}

/// CRC-16/Modbus: polynomial 0xA001 (reflected), initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// The four Modbus address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl RegisterKind {
    pub(crate) fn read_function(self) -> u8 {
        match self {
            Self::Coils            => function_codes::READ_COILS,
            Self::DiscreteInputs   => function_codes::READ_DISCRETE_INPUTS,
            Self::HoldingRegisters => function_codes::READ_HOLDING_REGISTERS,
            Self::InputRegisters   => function_codes::READ_INPUT_REGISTERS,
        }
    }
}

/// A span of values in one Modbus address space. Coil and discrete input
/// values are 0 or 1; register values use the full 16-bit range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUnit {
    pub kind: RegisterKind,
    pub start_address: u16,
    pub values: Vec<u16>,
}

impl DataUnit {
    /// A unit of `count` zeroed values, the shape of a read request.
    pub fn new(kind: RegisterKind, start_address: u16, count: usize) -> DataUnit {
        DataUnit { kind, start_address, values: vec![0; count] }
    }

    pub fn with_values(kind: RegisterKind, start_address: u16, values: Vec<u16>) -> DataUnit {
        DataUnit { kind, start_address, values }
    }

    pub fn value(&self, index: usize) -> u16 {
        self.values.get(index).copied().unwrap_or(0)
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }
}

/// Function code plus payload, without address or checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub function: u8,
    pub data: Vec<u8>,
}

impl Pdu {
    pub fn new(function: u8, data: Vec<u8>) -> Pdu {
        Pdu { function, data }
    }

    pub fn read_request(kind: RegisterKind, start_address: u16, count: u16) -> Pdu {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&start_address.to_be_bytes());
        data.extend_from_slice(&count.to_be_bytes());
        Pdu::new(kind.read_function(), data)
    }

    pub fn write_single_coil(address: u16, on: bool) -> Pdu {
        Pdu::write_single_coil_value(address, if on { 0xFF00 } else { 0x0000 })
    }

    /// Single coil write with an explicit payload value; the boards reuse
    /// this function for interval registers that ride on coil addresses.
    pub fn write_single_coil_value(address: u16, value: u16) -> Pdu {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&value.to_be_bytes());
        Pdu::new(function_codes::WRITE_SINGLE_COIL, data)
    }

    pub fn write_single_register(address: u16, value: u16) -> Pdu {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&value.to_be_bytes());
        Pdu::new(function_codes::WRITE_SINGLE_REGISTER, data)
    }

    pub fn write_multiple_coils(start_address: u16, count: u16, masks: &[u8]) -> Pdu {
        let mut data = Vec::with_capacity(5 + masks.len());
        data.extend_from_slice(&start_address.to_be_bytes());
        data.extend_from_slice(&count.to_be_bytes());
        data.push(masks.len() as u8);
        data.extend_from_slice(masks);
        Pdu::new(function_codes::WRITE_MULTIPLE_COILS, data)
    }

    pub fn write_multiple_registers(start_address: u16, values: &[u16]) -> Pdu {
        let mut data = Vec::with_capacity(5 + values.len() * 2);
        data.extend_from_slice(&start_address.to_be_bytes());
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push((values.len() * 2) as u8);
        for &value in values {
            data.extend_from_slice(&value.to_be_bytes());
        }
        Pdu::new(function_codes::WRITE_MULTIPLE_REGISTERS, data)
    }
}

/// Full RTU frame for `server`: address, PDU, CRC-16 appended low byte first.
pub fn encode_adu(server: u8, pdu: &Pdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + pdu.data.len());
    frame.push(server);
    frame.push(pdu.function);
    frame.extend_from_slice(&pdu.data);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Splits a received frame into source address and response, verifying the
/// checksum.
pub fn decode_adu(frame: &[u8]) -> Result<(u8, Response)> {
    if frame.len() < 4 {
        return Err(Error::Protocol(format!("frame too short: {} bytes", frame.len())));
    }
    let (body, checksum) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([checksum[0], checksum[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(Error::Protocol(format!(
            "CRC mismatch: received {:#06x}, computed {:#06x}", received, computed)));
    }
    let response = Response { function: body[1], data: body[2..].to_vec() };
    Ok((body[0], response))
}

/// A reply PDU as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub function: u8,
    pub data: Vec<u8>,
}

impl Response {
    pub fn is_exception(&self) -> bool {
        self.function & function_codes::EXCEPTION != 0
    }

    pub fn exception_code(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    /// Translates the payload into a data unit.
    ///
    /// Read responses decode to the address space their function code
    /// implies; bit payloads unpack LSB first, register payloads strip the
    /// leading byte count. Every other non-exception response decodes as
    /// input registers holding the payload's big-endian words, which is how
    /// write echoes reach the per-kind driver handlers. The start address
    /// carries the decoded byte count; the request's start address is not
    /// echoed by the server.
    pub fn decode(&self) -> Option<DataUnit> {
        if self.is_exception() || self.data.is_empty() {
            return None;
        }
        match self.function {
            function_codes::READ_COILS =>
                Some(self.decode_bits(RegisterKind::Coils)),
            function_codes::READ_DISCRETE_INPUTS =>
                Some(self.decode_bits(RegisterKind::DiscreteInputs)),
            function_codes::READ_HOLDING_REGISTERS =>
                Some(self.decode_registers(RegisterKind::HoldingRegisters)),
            function_codes::READ_INPUT_REGISTERS =>
                Some(self.decode_registers(RegisterKind::InputRegisters)),
            _ => {
                let values = words(&self.data);
                Some(DataUnit::with_values(
                    RegisterKind::InputRegisters, self.data.len() as u16, values))
            }
        }
    }

    fn decode_bits(&self, kind: RegisterKind) -> DataUnit {
        // first payload byte is the mask byte count
        let mut values = Vec::with_capacity((self.data.len() - 1) * 8);
        for &mask in &self.data[1..] {
            for bit in 0..8 {
                values.push(((mask >> bit) & 1) as u16);
            }
        }
        DataUnit::with_values(kind, self.data.len() as u16, values)
    }

    fn decode_registers(&self, kind: RegisterKind) -> DataUnit {
        let byte_count = self.data[0];
        DataUnit::with_values(kind, byte_count as u16, words(&self.data[1..]))
    }
}

/// Big-endian u16 words; a trailing odd byte becomes a value on its own.
fn words(data: &[u8]) -> Vec<u16> {
    data.chunks(2)
        .map(|chunk| match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [single] => *single as u16,
            _ => unreachable!()
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_crc16_reference_vector() {
        // read holding registers query from the protocol specification
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16(&data), 0xCDC5);
    }

    #[test]
    fn test_encode_write_single_coil() {
        let pdu = Pdu::write_single_coil(0x0002, true);
        let frame = encode_adu(1, &pdu);
        assert_eq!(&frame[..6], &[0x01, 0x05, 0x00, 0x02, 0xFF, 0x00]);
        let (server, response) = decode_adu(&frame).unwrap();
        assert_eq!(server, 1);
        assert_eq!(response.function, 0x05);
        assert_eq!(response.data, vec![0x00, 0x02, 0xFF, 0x00]);
    }

    #[test]
    fn test_encode_write_relay_mask() {
        let pdu = Pdu::write_multiple_coils(0x0000, 8, &[0x5A]);
        let frame = encode_adu(1, &pdu);
        assert_eq!(&frame[..8], &[0x01, 0x0F, 0x00, 0x00, 0x00, 0x08, 0x01, 0x5A]);
    }

    #[test]
    fn test_encode_write_multiple_registers() {
        let pdu = Pdu::write_multiple_registers(0x1000, &[0, 1, 2, 0, 0, 0, 0, 0]);
        assert_eq!(pdu.function, 0x10);
        assert_eq!(&pdu.data[..5], &[0x10, 0x00, 0x00, 0x08, 0x10]);
        assert_eq!(pdu.data.len(), 5 + 16);
        assert_eq!(&pdu.data[5..11], &[0x00, 0x00, 0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn test_crc_flip_rejected() {
        let mut frame = encode_adu(1, &Pdu::read_request(RegisterKind::Coils, 0, 8));
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(decode_adu(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decode_coils() {
        // eight relays, all off
        let response = Response { function: 0x01, data: vec![0x01, 0x00] };
        let unit = response.decode().unwrap();
        assert_eq!(unit.kind, RegisterKind::Coils);
        assert_eq!(unit.values, vec![0; 8]);

        let response = Response { function: 0x01, data: vec![0x01, 0b0000_0101] };
        let unit = response.decode().unwrap();
        assert_eq!(&unit.values[..4], &[1, 0, 1, 0]);
    }

    #[test]
    fn test_decode_input_registers() {
        // channel 0 at 3000, the rest at zero
        let mut data = vec![16u8];
        data.extend_from_slice(&[0x0B, 0xB8]);
        data.extend_from_slice(&[0; 14]);
        let response = Response { function: 0x04, data };
        let unit = response.decode().unwrap();
        assert_eq!(unit.kind, RegisterKind::InputRegisters);
        assert_eq!(unit.start_address, 16);
        assert_eq!(unit.values[0], 3000);
        assert_eq!(&unit.values[1..], &[0; 7]);
    }

    #[test]
    fn test_decode_write_echo_as_input_registers() {
        // write single register echo carries address and value as words
        let response = Response { function: 0x06, data: vec![0x40, 0x00, 0x00, 0x03] };
        let unit = response.decode().unwrap();
        assert_eq!(unit.kind, RegisterKind::InputRegisters);
        assert_eq!(unit.values, vec![0x4000, 0x0003]);
    }

    #[test]
    fn test_decode_exception() {
        let response = Response { function: 0x83, data: vec![0x02] };
        assert!(response.is_exception());
        assert_eq!(response.exception_code(), 0x02);
        assert!(response.decode().is_none());
    }
}
