mod analog;
mod config;
mod device;
mod frame;
mod link;
mod master;
mod regs;
mod relay;

#[derive(Debug)]
pub enum Error {
    /// No serial port matched the configured name. Recoverable; the link
    /// stays closed.
    NotFound(String),
    Connection(String),
    Configuration(String),
    Read(std::io::Error),
    Write(std::io::Error),
    Timeout,
    Protocol(String),
    ReplyAborted,
    Other(Box<dyn std::error::Error + Sync + Send + 'static>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotFound(name) =>
                write!(f, "serial port not found: {}", name),
            Self::Connection(message) =>
                write!(f, "connection error: {}", message),
            Self::Configuration(message) =>
                write!(f, "configuration error: {}", message),
            Self::Read(io_error) =>
                write!(f, "read error: {}", io_error),
            Self::Write(io_error) =>
                write!(f, "write error: {}", io_error),
            Self::Timeout =>
                write!(f, "request timed out"),
            Self::Protocol(message) =>
                write!(f, "protocol error: {}", message),
            Self::ReplyAborted =>
                write!(f, "reply aborted"),
            Self::Other(error) =>
                write!(f, "{}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            &Self::Read(ref io_error) | &Self::Write(ref io_error) => Some(io_error),
            _ => None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Other(error.into())
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

/// Locks a mutex, recovering the value if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub use config::{
    BaudRate,
    DataBits,
    StopBits,
    Parity,
    SerialConfig,
};

pub use frame::{
    RegisterKind,
    DataUnit,
    Pdu,
    Response,
};

pub use link::{
    Link,
    SerialLink,
    available_ports,
};

pub use master::{
    RtuMaster,
    TransportRequest,
    TransportEvent,
    ErrorKind,
};

pub use device::{
    Function,
    DeviceEvent,
    DeviceModel,
    DeviceHandle,
    Controller,
};

pub use relay::{
    RelayDevice,
    RelayEvent,
    RelayCommand,
    ControlMode,
    FlashMode,
};

pub use analog::{
    AnalogDevice,
    AdcEvent,
    AdcCommand,
    ChannelType,
};
