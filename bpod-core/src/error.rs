//! Core error types.

use thiserror::Error;

/// Errors raised while building, compiling or recording a state machine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown event: {event}")]
    UnknownEvent { event: String },

    #[error("unknown output action: {output}")]
    UnknownOutput { output: String },

    #[error("unknown input channel: {channel}")]
    UnknownInputChannel { channel: String },

    #[error("event '{event}' cannot trigger a state transition")]
    InvalidTransitionEvent { event: String },

    #[error("state '{name}' was referenced but never declared")]
    UndeclaredStateStillMissing { name: String },

    #[error("too many states: the device supports at most {max}")]
    TooManyStates { max: u16 },

    #[error("invalid global timer id {id} (device has {available})")]
    InvalidTimerId { id: usize, available: u8 },

    #[error("invalid global counter id {id} (device has {available})")]
    InvalidCounterId { id: usize, available: u8 },

    #[error("invalid condition id {id} (device has {available})")]
    InvalidConditionId { id: usize, available: u8 },

    #[error("{what} out of range: {value} (max {max})")]
    ValueOutOfRange {
        what: &'static str,
        value: u64,
        max: u64,
    },

    #[error("invalid {what}: {value}")]
    InvalidDuration { what: &'static str, value: f64 },

    #[error("state machine is sealed and can no longer be modified")]
    Sealed,

    #[error("device reported {timestamps} timestamps for {events} events")]
    TimestampMismatch { events: usize, timestamps: usize },

    #[error("invalid program definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    /// Returns whether the error is a problem with the program description,
    /// detected before any byte reaches the device.
    pub fn is_build_error(&self) -> bool {
        !matches!(self, CoreError::TimestampMismatch { .. })
    }

    /// Returns an error code suitable for logs and reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::UnknownEvent { .. } => "UNKNOWN_EVENT",
            CoreError::UnknownOutput { .. } => "UNKNOWN_OUTPUT",
            CoreError::UnknownInputChannel { .. } => "UNKNOWN_INPUT_CHANNEL",
            CoreError::InvalidTransitionEvent { .. } => "INVALID_TRANSITION_EVENT",
            CoreError::UndeclaredStateStillMissing { .. } => "UNDECLARED_STATE_STILL_MISSING",
            CoreError::TooManyStates { .. } => "TOO_MANY_STATES",
            CoreError::InvalidTimerId { .. }
            | CoreError::InvalidCounterId { .. }
            | CoreError::InvalidConditionId { .. } => "INVALID_ID",
            CoreError::ValueOutOfRange { .. } => "VALUE_OUT_OF_RANGE",
            CoreError::InvalidDuration { .. } => "INVALID_DURATION",
            CoreError::Sealed => "SEALED",
            CoreError::TimestampMismatch { .. } => "TIMESTAMP_MISMATCH",
            CoreError::InvalidDefinition { .. } | CoreError::Json(_) | CoreError::Yaml(_) => {
                "BAD_DEFINITION"
            }
        }
    }
}
