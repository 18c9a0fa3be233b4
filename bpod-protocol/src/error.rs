//! Protocol error types.

use thiserror::Error;

/// Errors raised while talking to the device over the byte stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol underrun: expected {expected} bytes, got {received}")]
    Underrun { expected: usize, received: usize },

    #[error("transport closed")]
    TransportClosed,

    #[error("{what} too large: {len} (max {max})")]
    PayloadTooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("invalid serial channel {0} (channels are numbered from 1)")]
    InvalidChannel(u8),

    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    /// Errors meaning the other end went away become [`TransportClosed`].
    ///
    /// [`TransportClosed`]: ProtocolError::TransportClosed
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => ProtocolError::TransportClosed,
            _ => ProtocolError::Io(err),
        }
    }
}

impl ProtocolError {
    /// Returns whether the byte stream must be considered desynchronized.
    ///
    /// The wire format has no resynchronization marker, so any short or
    /// failed read leaves the session unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::PayloadTooLarge { .. } | ProtocolError::InvalidChannel(_)
        )
    }

    /// Returns an error code suitable for logs and reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProtocolError::Underrun { .. } => "PROTOCOL_UNDERRUN",
            ProtocolError::TransportClosed => "TRANSPORT_CLOSED",
            ProtocolError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ProtocolError::InvalidChannel(_) => "INVALID_CHANNEL",
            ProtocolError::Io(_) => "IO_ERROR",
        }
    }
}
