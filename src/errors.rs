use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unexpected response 0x{response:02x} to command 0x{command:02x}")]
    UnexpectedResponse { command: u8, response: u8 },
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("calibration covers {available} samples but {requested} were requested")]
    CalibrationShape { requested: usize, available: usize },
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("sweep watchdog expired after {0:?}")]
    Watchdog(Duration),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Failure of a primitive transfer. Timeouts are kept apart from every other
/// outcome so callers can decide whether a retry makes sense.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("usb error: {0}")]
    Usb(rusb::Error),
    #[error("{0}")]
    Other(String),
}

impl From<rusb::Error> for TransportError {
    fn from(error: rusb::Error) -> Self {
        match error {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::NoDevice => TransportError::Disconnected,
            other => TransportError::Usb(other),
        }
    }
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
