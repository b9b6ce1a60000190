//! Error types for vnic.

use std::io;

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for interface creation and packet I/O.
#[derive(Error, Debug)]
pub enum Error {
    /// The device node could not be opened (missing driver, permission denied).
    #[error("Failed to open {path}: {source}")]
    Open {
        path: &'static str,
        #[source]
        source: io::Error,
    },

    /// A setup control request on the device descriptor failed.
    #[error("{request} failed: {source}")]
    ControlRequest {
        request: &'static str,
        #[source]
        source: io::Error,
    },

    /// Reading or writing the interface MTU failed.
    #[error("MTU request on {name} failed: {source}")]
    Mtu {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The interface was closed, either before the call or while it was blocked.
    #[error("Interface is closed")]
    Closed,

    /// The device stayed unwritable through every retry.
    #[error("Device not ready for writing")]
    WouldBlock,

    /// The kernel accepted only part of a frame.
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Offset lies past the end of the caller's buffer.
    #[error("Offset {offset} out of range for buffer of {len} bytes")]
    InvalidOffset { offset: usize, len: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap the last OS error as a failed control request.
    pub(crate) fn control(request: &'static str) -> Self {
        Self::ControlRequest {
            request,
            source: io::Error::last_os_error(),
        }
    }

    /// Check if this error was caused by closing the interface.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Open { source, .. }
            | Error::ControlRequest { source, .. }
            | Error::Mtu { source, .. } => source,
            Error::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
            Error::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, err),
            Error::ShortWrite { .. } => io::Error::new(io::ErrorKind::WriteZero, err),
            Error::InvalidOffset { .. } | Error::Config(_) | Error::Json(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
        }
    }
}
