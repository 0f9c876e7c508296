//! Serial Modbus RTU master.
//!
//! A single worker thread owns the link and pulls requests from a FIFO, so
//! at most one request is on the wire at any time, as multidrop RTU
//! operation requires. Callers never block: requests are enqueued and the
//! outcome is published as typed events to every subscriber.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::{BaudRate, DataBits, Parity, SerialConfig, StopBits};
use crate::frame::{DataUnit, Pdu, RegisterKind, Response};
use crate::link::{Link, SerialLink};
use crate::{lock, Error, Result};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    ReadUnit { server: u8, unit: DataUnit },
    WriteUnit { server: u8, unit: DataUnit },
    Raw { server: u8, pdu: Pdu },
}

impl TransportRequest {
    pub fn server(&self) -> u8 {
        match self {
            Self::ReadUnit { server, .. } |
            Self::WriteUnit { server, .. } |
            Self::Raw { server, .. } => *server,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Read,
    Write,
    Connection,
    Configuration,
    Timeout,
    Protocol,
    ReplyAborted,
    Unknown,
}

impl ErrorKind {
    fn of(error: &Error) -> ErrorKind {
        match error {
            Error::NotFound(_) | Error::Connection(_) => ErrorKind::Connection,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Read(_) => ErrorKind::Read,
            Error::Write(_) => ErrorKind::Write,
            Error::Timeout => ErrorKind::Timeout,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::ReplyAborted => ErrorKind::ReplyAborted,
            Error::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Whether an error of this kind forces the link closed. A timed out
    /// slave must not take the rest of the multidrop chain down with it.
    fn is_fatal(self) -> bool {
        matches!(self, Self::Connection | Self::Configuration | Self::Protocol)
    }
}

/// Bus events, published in order. `server` is always the address the
/// request was issued to, not the address field of the reply frame, so
/// that consumers sharing the stream can filter reliably.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Opened,
    Closed,
    Error { server: u8, kind: ErrorKind, message: String },
    /// One per successful reply; `unit` is present when the response
    /// decoded as a data unit.
    Received { server: u8, response: Response, unit: Option<DataUnit> },
    /// Dispatch boundary: always follows the `Received` or `Error` event
    /// of the same request.
    Complete { server: u8 },
}

enum Command {
    Open,
    Close,
    Reconfigure,
    Request(TransportRequest),
}

type EventSink = Box<dyn FnMut(&TransportEvent) -> bool + Send>;

struct Shared {
    config: Mutex<SerialConfig>,
    timeout: Mutex<Duration>,
    sinks: Mutex<Vec<EventSink>>,
    open: AtomicBool,
    closing: AtomicBool,
}

/// Handle to a master. Clones share the same worker and link; the worker
/// exits once every handle is dropped.
#[derive(Clone)]
pub struct RtuMaster {
    shared: Arc<Shared>,
    commands: Sender<Command>,
}

impl RtuMaster {
    /// Master over a system serial port.
    pub fn new() -> RtuMaster {
        Self::with_link(SerialLink::new())
    }

    /// Master over any transport; tests substitute a scripted link.
    pub fn with_link<L: Link + 'static>(link: L) -> RtuMaster {
        let shared = Arc::new(Shared {
            config: Mutex::new(SerialConfig::default()),
            timeout: Mutex::new(DEFAULT_RESPONSE_TIMEOUT),
            sinks: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        let (commands, inbox) = mpsc::channel();
        let worker = Worker { link, shared: shared.clone(), inbox };
        thread::spawn(move || worker.run());
        RtuMaster { shared, commands }
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.shared.closing.store(false, Ordering::SeqCst);
        let _ = self.commands.send(Command::Open);
    }

    /// Closes the link. Requests still queued fail with `ReplyAborted`.
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Close);
    }

    pub fn read(&self, server: u8, unit: DataUnit) {
        self.request(TransportRequest::ReadUnit { server, unit });
    }

    pub fn write(&self, server: u8, unit: DataUnit) {
        self.request(TransportRequest::WriteUnit { server, unit });
    }

    pub fn send(&self, server: u8, pdu: Pdu) {
        self.request(TransportRequest::Raw { server, pdu });
    }

    fn request(&self, request: TransportRequest) {
        let server = request.server();
        if !(1..=247).contains(&server) {
            log::error!("MODBUS: invalid server address: {}", server);
            return;
        }
        let _ = self.commands.send(Command::Request(request));
    }

    /// Registers an event sink, called serially from the worker thread for
    /// every event. The sink is detached once it returns false.
    pub fn attach(&self, sink: impl FnMut(&TransportEvent) -> bool + Send + 'static) {
        lock(&self.shared.sinks).push(Box::new(sink));
    }

    pub fn subscribe(&self) -> Receiver<TransportEvent> {
        let (sender, receiver) = mpsc::channel();
        self.attach(move |event| sender.send(event.clone()).is_ok());
        receiver
    }

    pub fn config(&self) -> SerialConfig {
        lock(&self.shared.config).clone()
    }

    pub fn port_name(&self) -> String {
        lock(&self.shared.config).port_name.clone()
    }

    pub fn set_port_name(&self, name: &str) {
        let mut config = lock(&self.shared.config);
        if config.port_name != name {
            config.port_name = name.to_string();
            if self.is_open() {
                log::warn!("MODBUS: port name change takes effect on the next open");
            }
        }
    }

    pub fn baud_rate(&self) -> BaudRate {
        lock(&self.shared.config).baud_rate
    }

    pub fn set_baud_rate(&self, rate: BaudRate) {
        let changed = {
            let mut config = lock(&self.shared.config);
            let changed = config.baud_rate != rate;
            config.baud_rate = rate;
            changed
        };
        if changed && self.is_open() {
            let _ = self.commands.send(Command::Reconfigure);
        }
    }

    pub fn parity(&self) -> Parity {
        lock(&self.shared.config).parity
    }

    pub fn set_parity(&self, parity: Parity) {
        let changed = {
            let mut config = lock(&self.shared.config);
            let changed = config.parity != parity;
            config.parity = parity;
            changed
        };
        if changed && self.is_open() {
            let _ = self.commands.send(Command::Reconfigure);
        }
    }

    pub fn data_bits(&self) -> DataBits {
        lock(&self.shared.config).data_bits
    }

    pub fn set_data_bits(&self, bits: DataBits) {
        let mut config = lock(&self.shared.config);
        if config.data_bits != bits {
            config.data_bits = bits;
            if self.is_open() {
                log::warn!("MODBUS: data bits change takes effect on the next open");
            }
        }
    }

    pub fn stop_bits(&self) -> StopBits {
        lock(&self.shared.config).stop_bits
    }

    pub fn set_stop_bits(&self, bits: StopBits) {
        let mut config = lock(&self.shared.config);
        if config.stop_bits != bits {
            config.stop_bits = bits;
            if self.is_open() {
                log::warn!("MODBUS: stop bits change takes effect on the next open");
            }
        }
    }

    pub fn response_timeout(&self) -> Duration {
        *lock(&self.shared.timeout)
    }

    pub fn set_response_timeout(&self, timeout: Duration) {
        *lock(&self.shared.timeout) = timeout;
    }
}

impl Default for RtuMaster {
    fn default() -> Self {
        RtuMaster::new()
    }
}

struct Worker<L: Link> {
    link: L,
    shared: Arc<Shared>,
    inbox: Receiver<Command>,
}

impl<L: Link> Worker<L> {
    fn run(mut self) {
        log::debug!("MODBUS: queue worker started");
        while let Ok(command) = self.inbox.recv() {
            match command {
                Command::Open => self.open(),
                Command::Close => self.close(),
                Command::Reconfigure => self.reconfigure(),
                Command::Request(request) => self.process(request),
            }
        }
        if self.link.is_open() {
            self.link.close();
        }
        log::debug!("MODBUS: queue worker finished");
    }

    fn emit(&self, event: TransportEvent) {
        lock(&self.shared.sinks).retain_mut(|sink| sink(&event));
    }

    fn open(&mut self) {
        if self.link.is_open() {
            return;
        }
        let config = lock(&self.shared.config).clone();
        match self.link.open(&config) {
            Ok(()) => {
                self.shared.open.store(true, Ordering::SeqCst);
                self.emit(TransportEvent::Opened);
            }
            Err(error) => {
                log::error!("MODBUS: open failed: {}", error);
                self.emit(TransportEvent::Error {
                    server: 0,
                    kind: ErrorKind::of(&error),
                    message: error.to_string(),
                });
            }
        }
    }

    fn close(&mut self) {
        if self.link.is_open() {
            self.link.close();
            self.shared.open.store(false, Ordering::SeqCst);
            self.emit(TransportEvent::Closed);
        }
        self.shared.closing.store(false, Ordering::SeqCst);
    }

    fn reconfigure(&mut self) {
        if !self.link.is_open() {
            return;
        }
        let config = lock(&self.shared.config).clone();
        if let Err(error) = self.link.reconfigure(&config) {
            self.fail(0, error);
        }
    }

    fn process(&mut self, request: TransportRequest) {
        let server = request.server();
        if self.shared.closing.load(Ordering::SeqCst) {
            self.fail(server, Error::ReplyAborted);
            return;
        }
        if !self.link.is_open() {
            self.fail(server, Error::Connection("port not open".to_string()));
            return;
        }
        let pdu = match build_pdu(&request) {
            Ok(pdu) => pdu,
            Err(error) => {
                self.fail(server, error);
                return;
            }
        };
        log::debug!("MODBUS: request server {} function {:#04x} data {:02x?}",
            server, pdu.function, pdu.data);
        let timeout = *lock(&self.shared.timeout);
        match self.link.transact(server, &pdu, timeout) {
            Ok(_) | Err(_) if self.shared.closing.load(Ordering::SeqCst) => {
                // the link was closed under the request
                self.fail(server, Error::ReplyAborted);
            }
            Ok(response) => {
                let unit = response.decode();
                if response.is_exception() {
                    log::warn!("MODBUS: exception response from server {}: code {:#04x}",
                        server, response.exception_code());
                } else {
                    log::debug!("MODBUS: response function {:#04x} size {} unit {:?}",
                        response.function, response.data.len(), unit);
                }
                self.emit(TransportEvent::Received { server, response, unit });
                self.emit(TransportEvent::Complete { server });
            }
            Err(error) => self.fail(server, error),
        }
    }

    fn fail(&mut self, server: u8, error: Error) {
        let kind = ErrorKind::of(&error);
        log::error!("MODBUS: {}", error);
        self.emit(TransportEvent::Error { server, kind, message: error.to_string() });
        self.emit(TransportEvent::Complete { server });
        if kind.is_fatal() && self.link.is_open() {
            self.link.close();
            self.shared.open.store(false, Ordering::SeqCst);
            self.emit(TransportEvent::Closed);
        }
    }
}

fn build_pdu(request: &TransportRequest) -> Result<Pdu> {
    match request {
        TransportRequest::Raw { pdu, .. } => Ok(pdu.clone()),
        TransportRequest::ReadUnit { unit, .. } => {
            if unit.values.is_empty() {
                return Err(Error::Configuration("empty data unit".to_string()));
            }
            Ok(Pdu::read_request(unit.kind, unit.start_address, unit.values.len() as u16))
        }
        TransportRequest::WriteUnit { unit, .. } => match unit.kind {
            RegisterKind::Coils if unit.values.len() == 1 =>
                Ok(Pdu::write_single_coil(unit.start_address, unit.values[0] != 0)),
            RegisterKind::Coils => {
                let mut masks = vec![0u8; (unit.values.len() + 7) / 8];
                for (index, &value) in unit.values.iter().enumerate() {
                    if value != 0 {
                        masks[index / 8] |= 1 << (index % 8);
                    }
                }
                Ok(Pdu::write_multiple_coils(
                    unit.start_address, unit.values.len() as u16, &masks))
            }
            RegisterKind::HoldingRegisters if unit.values.len() == 1 =>
                Ok(Pdu::write_single_register(unit.start_address, unit.values[0])),
            RegisterKind::HoldingRegisters if !unit.values.is_empty() =>
                Ok(Pdu::write_multiple_registers(unit.start_address, &unit.values)),
            RegisterKind::HoldingRegisters =>
                Err(Error::Configuration("empty data unit".to_string())),
            RegisterKind::DiscreteInputs | RegisterKind::InputRegisters =>
                Err(Error::Configuration("write to a read-only register kind".to_string())),
        },
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::link::mock::{echo_script, MockLink};

    fn expect(events: &Receiver<TransportEvent>) -> TransportEvent {
        events.recv_timeout(Duration::from_secs(2)).expect("no event")
    }

    #[test]
    fn test_read_event_pairing() {
        let master = RtuMaster::with_link(MockLink::new(echo_script));
        let events = master.subscribe();
        master.open();
        assert!(matches!(expect(&events), TransportEvent::Opened));

        master.read(1, DataUnit::new(RegisterKind::Coils, 0x0000, 8));
        match expect(&events) {
            TransportEvent::Received { server, response, unit } => {
                assert_eq!(server, 1);
                assert_eq!(response.function, 0x01);
                let unit = unit.expect("undecoded response");
                assert_eq!(unit.kind, RegisterKind::Coils);
                assert_eq!(unit.values, vec![0; 8]);
            }
            event => panic!("unexpected event: {:?}", event),
        }
        assert!(matches!(expect(&events), TransportEvent::Complete { server: 1 }));
    }

    #[test]
    fn test_write_maps_to_single_coil() {
        let master = RtuMaster::with_link(MockLink::new(|_server, pdu| {
            assert_eq!(pdu.function, 0x05);
            assert_eq!(pdu.data, vec![0x00, 0x02, 0xFF, 0x00]);
            echo_script(_server, pdu)
        }));
        let events = master.subscribe();
        master.open();
        assert!(matches!(expect(&events), TransportEvent::Opened));

        master.write(1, DataUnit::with_values(RegisterKind::Coils, 0x0002, vec![1]));
        assert!(matches!(expect(&events), TransportEvent::Received { server: 1, .. }));
        assert!(matches!(expect(&events), TransportEvent::Complete { server: 1 }));
    }

    #[test]
    fn test_timeout_keeps_link_open() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let master = RtuMaster::with_link(MockLink::new(move |server, pdu| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Timeout)
            } else {
                echo_script(server, pdu)
            }
        }));
        let events = master.subscribe();
        master.open();
        assert!(matches!(expect(&events), TransportEvent::Opened));

        master.send(7, Pdu::read_request(RegisterKind::InputRegisters, 0, 8));
        assert!(matches!(expect(&events),
            TransportEvent::Error { server: 7, kind: ErrorKind::Timeout, .. }));
        assert!(matches!(expect(&events), TransportEvent::Complete { server: 7 }));
        assert!(master.is_open());

        // the next slave in the chain is still reachable
        master.send(1, Pdu::read_request(RegisterKind::InputRegisters, 0, 8));
        assert!(matches!(expect(&events), TransportEvent::Received { server: 1, .. }));
        assert!(matches!(expect(&events), TransportEvent::Complete { server: 1 }));
    }

    #[test]
    fn test_protocol_error_closes_link() {
        let master = RtuMaster::with_link(MockLink::new(|_server, _pdu| {
            Err(Error::Protocol("CRC mismatch".to_string()))
        }));
        let events = master.subscribe();
        master.open();
        assert!(matches!(expect(&events), TransportEvent::Opened));

        master.send(1, Pdu::read_request(RegisterKind::Coils, 0, 8));
        assert!(matches!(expect(&events),
            TransportEvent::Error { server: 1, kind: ErrorKind::Protocol, .. }));
        assert!(matches!(expect(&events), TransportEvent::Complete { server: 1 }));
        assert!(matches!(expect(&events), TransportEvent::Closed));
        assert!(!master.is_open());
    }

    #[test]
    fn test_close_aborts_pending_requests() {
        let (started_send, started_recv) = mpsc::channel();
        let (release_send, release_recv) = mpsc::channel();
        let master = RtuMaster::with_link(MockLink::new(move |server, pdu| {
            started_send.send(()).expect("started");
            release_recv.recv().expect("release");
            echo_script(server, pdu)
        }));
        let events = master.subscribe();
        master.open();
        assert!(matches!(expect(&events), TransportEvent::Opened));

        master.send(1, Pdu::read_request(RegisterKind::Coils, 0, 8));
        started_recv.recv_timeout(Duration::from_secs(2)).expect("request on the wire");
        master.send(2, Pdu::read_request(RegisterKind::Coils, 0, 8));
        master.send(3, Pdu::read_request(RegisterKind::Coils, 0, 8));
        master.close();
        release_send.send(()).expect("release");

        for server in 1..=3 {
            assert!(matches!(expect(&events),
                TransportEvent::Error { server: s, kind: ErrorKind::ReplyAborted, .. } if s == server));
            assert!(matches!(expect(&events),
                TransportEvent::Complete { server: s } if s == server));
        }
        assert!(matches!(expect(&events), TransportEvent::Closed));
    }

    #[test]
    fn test_invalid_server_rejected_locally() {
        let master = RtuMaster::with_link(MockLink::new(echo_script));
        let events = master.subscribe();
        master.send(0, Pdu::read_request(RegisterKind::Coils, 0, 8));
        master.send(248, Pdu::read_request(RegisterKind::Coils, 0, 8));
        master.open();
        // the rejected requests produced no events ahead of the open
        assert!(matches!(expect(&events), TransportEvent::Opened));
    }

    #[test]
    fn test_one_request_in_flight() {
        let overlapped = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicBool::new(false));
        let overlap = overlapped.clone();
        let flag = busy.clone();
        let master = RtuMaster::with_link(MockLink::new(move |server, pdu| {
            if flag.swap(true, Ordering::SeqCst) {
                overlap.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            flag.store(false, Ordering::SeqCst);
            echo_script(server, pdu)
        }));
        let events = master.subscribe();
        master.open();
        assert!(matches!(expect(&events), TransportEvent::Opened));

        for _ in 0..5 {
            master.send(1, Pdu::read_request(RegisterKind::Coils, 0, 8));
        }
        for _ in 0..5 {
            assert!(matches!(expect(&events), TransportEvent::Received { .. }));
            assert!(matches!(expect(&events), TransportEvent::Complete { .. }));
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }
}
