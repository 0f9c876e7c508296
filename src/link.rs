//! Serial transport beneath the RTU master.
//!
//! Frames are delimited by line silence: a pause of at least 3.5 character
//! times ends the reply, so the port read timeout doubles as the frame
//! boundary detector.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::config::{DataBits, Parity, SerialConfig, StopBits};
use crate::frame::{self, Pdu, Response};
use crate::{Error, Result};

/// Transport used by the master: opens a port and performs one
/// request/response round trip at a time.
pub trait Link: Send {
    fn open(&mut self, config: &SerialConfig) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// Applies baud rate and parity changes to an already open port.
    fn reconfigure(&mut self, config: &SerialConfig) -> Result<()>;
    /// Writes the request and waits up to `timeout` for a reply frame
    /// addressed back from `server`.
    fn transact(&mut self, server: u8, pdu: &Pdu, timeout: Duration) -> Result<Response>;
}

pub struct SerialLink {
    port: Option<Box<dyn serialport::SerialPort>>,
    gap: Duration,
}

impl SerialLink {
    pub fn new() -> SerialLink {
        SerialLink { port: None, gap: Duration::from_millis(2) }
    }
}

impl Default for SerialLink {
    fn default() -> Self {
        SerialLink::new()
    }
}

impl Link for SerialLink {
    fn open(&mut self, config: &SerialConfig) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let path = resolve_port_name(&config.port_name)?;
        // the read timeout marks the inter-frame silence; the serial layer
        // rounds below roughly 1 ms, so keep a floor there
        self.gap = config.inter_frame_gap().max(Duration::from_millis(2));
        let port = serialport::new(&path, config.baud_rate.bits_per_second())
            .data_bits(data_bits(config.data_bits))
            .stop_bits(stop_bits(config.stop_bits))
            .parity(parity(config.parity))
            .flow_control(serialport::FlowControl::None)
            .timeout(self.gap)
            .open()
            .map_err(|error| match error.kind() {
                serialport::ErrorKind::NoDevice => Error::NotFound(path.clone()),
                _ => Error::Connection(error.to_string()),
            })?;
        log::info!("MODBUS: opened {} at {} baud", path, config.baud_rate.bits_per_second());
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn reconfigure(&mut self, config: &SerialConfig) -> Result<()> {
        let Some(port) = self.port.as_mut() else { return Ok(()) };
        port.set_baud_rate(config.baud_rate.bits_per_second())
            .map_err(|error| Error::Configuration(error.to_string()))?;
        port.set_parity(parity(config.parity))
            .map_err(|error| Error::Configuration(error.to_string()))?;
        self.gap = config.inter_frame_gap().max(Duration::from_millis(2));
        port.set_timeout(self.gap)
            .map_err(|error| Error::Configuration(error.to_string()))?;
        log::info!("MODBUS: line reconfigured to {} baud, {:?} parity",
            config.baud_rate.bits_per_second(), config.parity);
        Ok(())
    }

    fn transact(&mut self, server: u8, pdu: &Pdu, timeout: Duration) -> Result<Response> {
        let port = self.port.as_mut()
            .ok_or_else(|| Error::Connection("port not open".to_string()))?;

        let adu = frame::encode_adu(server, pdu);
        log::trace!("MODBUS: send {:02x?}", adu);
        port.clear(serialport::ClearBuffer::All)
            .map_err(|error| Error::Write(io::Error::new(io::ErrorKind::Other, error)))?;
        port.write_all(&adu).map_err(Error::Write)?;
        port.flush().map_err(Error::Write)?;

        let deadline = Instant::now() + timeout;
        let mut buffer: Vec<u8> = Vec::with_capacity(256);
        let mut scratch = [0u8; 256];
        loop {
            match port.read(&mut scratch) {
                Ok(n) if n > 0 => buffer.extend_from_slice(&scratch[..n]),
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::TimedOut => {
                    if buffer.is_empty() {
                        if Instant::now() >= deadline {
                            return Err(Error::Timeout);
                        }
                        continue;
                    }
                    // silence after data: the frame is complete
                    log::trace!("MODBUS: recv {:02x?}", buffer);
                    let (source, response) = frame::decode_adu(&buffer)?;
                    if source != server {
                        // another station on the multidrop bus; keep listening
                        log::warn!("MODBUS: discarding frame from server {}", source);
                        buffer.clear();
                        continue;
                    }
                    if response.function & 0x7F != pdu.function & 0x7F {
                        return Err(Error::Protocol(format!(
                            "function mismatch: sent {:#04x}, received {:#04x}",
                            pdu.function, response.function)));
                    }
                    return Ok(response);
                }
                Err(error) => return Err(Error::Read(error)),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }
}

/// Names of the serial ports known to the system.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|error| Error::Connection(error.to_string()))?;
    Ok(ports.into_iter().map(|info| info.port_name).collect())
}

/// Resolves a configured port name to a device path. A `/dev/ttyMB*`
/// symlink whose name contains the configured name takes precedence (the
/// conventional alias for the RS-485 adapters), then the system port list
/// is searched.
fn resolve_port_name(name: &str) -> Result<String> {
    #[cfg(unix)]
    if let Some(path) = resolve_symlink(name) {
        return Ok(path);
    }
    for info in serialport::available_ports()
        .map_err(|error| Error::Connection(error.to_string()))?
    {
        if info.port_name.contains(name) {
            return Ok(info.port_name);
        }
    }
    Err(Error::NotFound(name.to_string()))
}

#[cfg(unix)]
fn resolve_symlink(name: &str) -> Option<String> {
    let entries = std::fs::read_dir("/dev").ok()?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if !file_name.starts_with("ttyMB") || !file_name.contains(name) {
            continue;
        }
        let Ok(metadata) = std::fs::symlink_metadata(entry.path()) else { continue };
        if !metadata.file_type().is_symlink() {
            continue;
        }
        let Ok(target) = std::fs::canonicalize(entry.path()) else { continue };
        let target = target.to_string_lossy().into_owned();
        log::info!("MODBUS: using device {} for {}", target, name);
        return Some(target);
    }
    None
}

fn data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five  => serialport::DataBits::Five,
        DataBits::Six   => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn stop_bits(bits: StopBits) -> serialport::StopBits {
    match bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::OnePointFive => {
            log::warn!("MODBUS: 1.5 stop bits not supported by the serial layer, using 2");
            serialport::StopBits::Two
        }
        StopBits::Two => serialport::StopBits::Two,
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd  => serialport::Parity::Odd,
        Parity::Mark | Parity::Space => {
            log::warn!("MODBUS: {:?} parity not supported by the serial layer, using none", parity);
            serialport::Parity::None
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Scripted transport: every transaction is answered by the script
    /// closure, so the master and the drivers can be exercised without
    /// hardware.
    pub(crate) struct MockLink<F> {
        script: F,
        open: bool,
    }

    impl<F> MockLink<F>
    where
        F: FnMut(u8, &Pdu) -> Result<Response> + Send,
    {
        pub(crate) fn new(script: F) -> MockLink<F> {
            MockLink { script, open: false }
        }
    }

    impl<F> Link for MockLink<F>
    where
        F: FnMut(u8, &Pdu) -> Result<Response> + Send,
    {
        fn open(&mut self, _config: &SerialConfig) -> Result<()> {
            self.open = true;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn reconfigure(&mut self, _config: &SerialConfig) -> Result<()> {
            Ok(())
        }

        fn transact(&mut self, server: u8, pdu: &Pdu, _timeout: Duration) -> Result<Response> {
            (self.script)(server, pdu)
        }
    }

    /// Echoes write requests and zero-fills reads, the way an idle board
    /// would answer.
    pub(crate) fn echo_script(_server: u8, pdu: &Pdu) -> Result<Response> {
        use crate::frame::function_codes as fc;
        let data = match pdu.function {
            fc::READ_COILS | fc::READ_DISCRETE_INPUTS => {
                let count = u16::from_be_bytes([pdu.data[2], pdu.data[3]]);
                let bytes = (count as usize + 7) / 8;
                let mut data = vec![bytes as u8];
                data.resize(1 + bytes, 0);
                data
            }
            fc::READ_HOLDING_REGISTERS | fc::READ_INPUT_REGISTERS => {
                let count = u16::from_be_bytes([pdu.data[2], pdu.data[3]]);
                let mut data = vec![(count * 2) as u8];
                data.resize(1 + count as usize * 2, 0);
                data
            }
            fc::WRITE_MULTIPLE_COILS | fc::WRITE_MULTIPLE_REGISTERS =>
                pdu.data[..4].to_vec(),
            _ => pdu.data.clone(),
        };
        Ok(Response { function: pdu.function, data })
    }
}
