//! Client error types.

use crate::config::ConfigError;
use bpod_core::CoreError;
use bpod_emulator::EmulatorError;
use bpod_protocol::ProtocolError;
use thiserror::Error;

/// Session errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Emulator(#[from] EmulatorError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("handshake failed: expected '5', got {ack:#04x}")]
    HandshakeFailed { ack: u8 },

    #[error("firmware {found} is older than the supported version {target}")]
    FirmwareTooOld { found: u16, target: u16 },

    #[error("firmware {found} is newer than the supported version {target}")]
    FirmwareTooNew { found: u16, target: u16 },

    #[error("device rejected the input port configuration")]
    PortEnableFailed,

    #[error("device rejected the sync channel configuration")]
    SyncConfigFailed,

    #[error("device did not acknowledge the state machine")]
    ProgramNotAcknowledged,

    #[error("device rejected serial messages for channel {channel}")]
    SerialMessageRejected { channel: u8 },

    #[error("unknown opcode {0} from device")]
    UnknownOpcode(u8),

    #[error("not connected")]
    NotConnected,

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),
}

impl ClientError {
    /// Returns whether the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Protocol(e) => e.is_fatal(),
            ClientError::Core(_) | ClientError::Config(_) | ClientError::InvalidState(_) => false,
            ClientError::Emulator(e) => matches!(e, EmulatorError::NotInitialized),
            ClientError::SerialMessageRejected { .. } => false,
            _ => true,
        }
    }

    /// Returns an error code suitable for logs and reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            ClientError::Io(_) => "IO_ERROR",
            ClientError::Protocol(e) => e.error_code(),
            ClientError::Core(e) => e.error_code(),
            ClientError::Emulator(e) => e.error_code(),
            ClientError::Config(_) => "CONFIG_ERROR",
            ClientError::HandshakeFailed { .. } => "HANDSHAKE_FAILED",
            ClientError::FirmwareTooOld { .. } => "FIRMWARE_TOO_OLD",
            ClientError::FirmwareTooNew { .. } => "FIRMWARE_TOO_NEW",
            ClientError::PortEnableFailed => "PORT_ENABLE_FAILED",
            ClientError::SyncConfigFailed => "SYNC_CONFIG_FAILED",
            ClientError::ProgramNotAcknowledged => "PROGRAM_NOT_ACKNOWLEDGED",
            ClientError::SerialMessageRejected { .. } => "SERIAL_MESSAGE_REJECTED",
            ClientError::UnknownOpcode(_) => "UNKNOWN_OPCODE",
            ClientError::NotConnected => "NOT_CONNECTED",
            ClientError::InvalidState(_) => "INVALID_STATE",
        }
    }
}
