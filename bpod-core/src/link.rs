//! The seam between the session runner and a device backend.
//!
//! The serial device and the software emulator both implement
//! [`DeviceLink`], so one run loop drives either.

use crate::builder::CompiledProgram;
use crate::hardware::HardwareDescription;
use crate::state_machine::StateMachine;

/// Something the device reported while a trial runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A batch of event codes. Code 255 marks the end of the trial.
    Events(Vec<u8>),
    /// A soft code emitted by a state's `SoftCode` output.
    SoftCode(u8),
    /// The byte stream closed. Nothing more will be reported.
    Closed,
}

/// Timing read back once a trial has ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialTiming {
    /// Device clock at trial start, in seconds.
    pub trial_start_timestamp: f64,
    /// Seconds since trial start, one per event.
    pub event_timestamps: Vec<f64>,
}

/// A device that runs compiled programs.
pub trait DeviceLink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn hardware(&self) -> &HardwareDescription;

    /// Installs a program. It takes effect at the next [`start_trial`].
    ///
    /// [`start_trial`]: DeviceLink::start_trial
    fn upload(&mut self, program: &CompiledProgram) -> Result<(), Self::Error>;

    /// Starts the installed program. `sma` is the machine it was compiled
    /// from.
    fn start_trial(&mut self, sma: &StateMachine) -> Result<(), Self::Error>;

    /// Returns the next report, or `None` when nothing is pending. Never
    /// blocks for long.
    fn poll_event(&mut self) -> Result<Option<DeviceEvent>, Self::Error>;

    /// Asks the device to end the running trial.
    fn request_stop(&mut self) -> Result<(), Self::Error>;

    /// Reads the trial timing after the end-of-trial event.
    fn finish_trial(&mut self) -> Result<TrialTiming, Self::Error>;

    /// Injects an event code. Returns `false` if the backend cannot.
    fn trigger_event(&mut self, code: usize) -> Result<bool, Self::Error>;

    /// Forces an input channel level. Returns `false` if the backend cannot.
    fn override_input(&mut self, channel: usize, value: u8) -> Result<bool, Self::Error>;

    fn override_output(&mut self, channel: usize, value: u8) -> Result<(), Self::Error>;

    /// Sends raw bytes to a serial module channel (1-based).
    fn send_serial(&mut self, channel: u8, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Stores `(message_id, bytes)` pairs on the device for a serial module
    /// channel (1-based), to be sent later by a state's serial output.
    fn load_serial_messages(&mut self, channel: u8, messages: &[(u8, &[u8])])
        -> Result<(), Self::Error>;

    /// Clears every stored serial message.
    fn reset_serial_messages(&mut self) -> Result<(), Self::Error>;

    fn disconnect(&mut self) -> Result<(), Self::Error>;
}
