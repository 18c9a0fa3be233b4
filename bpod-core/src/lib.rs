//! # bpod-core
//!
//! State machine model for the bpod host driver.
//!
//! This crate provides:
//! - Hardware description and the channel map derived from it
//! - The incrementally built state machine and its finalization pass
//! - The message builder producing the 8-bit and 32-bit device tables
//! - Transition resolution shared by the session runner and the emulator
//! - Program descriptions loaded from JSON or YAML
//! - Trial records and the `DeviceLink` seam implemented by device backends

pub mod builder;
pub mod channels;
pub mod definition;
pub mod error;
pub mod hardware;
pub mod link;
pub mod state_machine;
pub mod transition;
pub mod trial;

pub use builder::CompiledProgram;
pub use channels::{ChannelMap, EventClass, EventMarkers, InputLevel};
pub use definition::ProgramDefinition;
pub use error::CoreError;
pub use hardware::{HardwareDescription, PortType};
pub use link::{DeviceEvent, DeviceLink, TrialTiming};
pub use state_machine::{
    Conditions, Destination, GlobalCounters, GlobalTimer, GlobalTimers, Matrix, OutputAction,
    State, StateMachine, Transition,
};
pub use transition::Step;
pub use trial::{EventOccurrence, RawEvents, StateOccurrence, Trial, TrialRecorder};
