//! Error kinds surfaced by the runtime.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between a host call and the servo bus.
///
/// Frame-level failures (`Protocol`, `Timeout`) are absorbed by the motor
/// bus retry ladder and almost never reach callers directly; engines see
/// either a sensible value or a fallback sentinel.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening, writing or reading the serial line failed at the OS level.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame arrived but its checksum, id or length did not validate.
    #[error("protocol error from motor {id}: {reason}")]
    Protocol { id: u8, reason: String },

    /// A read exceeded its budgeted window.
    #[error("timed out waiting for a response")]
    Timeout,

    /// Bad or missing setup, rejected before any I/O happens.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The process handle's `stop()` fired before a persistable state
    /// was reached.
    #[error("stopped by user")]
    Stopped,

    /// Discovery could not match a requested device identity to a port.
    #[error("not found: {0}")]
    NotFound(String),

    /// Reading or writing the calibration artifact failed.
    #[error("calibration store error: {0}")]
    Store(String),
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
