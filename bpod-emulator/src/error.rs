//! Emulator error types.

use bpod_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmulatorError {
    /// A method was called before `initialize()`.
    #[error("EmulatorNotInitialized: initialize() has not been called")]
    NotInitialized,

    #[error("unknown event: {event}")]
    UnknownEvent { event: String },

    #[error("unknown channel: {channel}")]
    UnknownChannel { channel: usize },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl EmulatorError {
    pub fn error_code(&self) -> &'static str {
        match self {
            EmulatorError::NotInitialized => "EMULATOR_NOT_INITIALIZED",
            EmulatorError::UnknownEvent { .. } => "UNKNOWN_EVENT",
            EmulatorError::UnknownChannel { .. } => "UNKNOWN_CHANNEL",
            EmulatorError::Core(e) => e.error_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_initialized_display() {
        let err = EmulatorError::NotInitialized;
        assert!(err.to_string().starts_with("EmulatorNotInitialized"));
        assert_eq!(err.error_code(), "EMULATOR_NOT_INITIALIZED");
    }

    #[test]
    fn test_core_error_passthrough() {
        let err: EmulatorError = CoreError::Sealed.into();
        assert_eq!(err.error_code(), "SEALED");
    }
}
