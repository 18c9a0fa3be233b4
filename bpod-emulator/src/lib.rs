//! # bpod-emulator
//!
//! Software stand-in for the bpod state machine controller.
//!
//! The [`Emulator`] evaluates a [`bpod_core::StateMachine`] the way the
//! device firmware does: manual overrides, global timers, global counters,
//! conditions and state timers produce event batches, and transitions are
//! resolved with the same rules the session runner uses. It implements
//! [`bpod_core::DeviceLink`], so sessions run unchanged without hardware.

pub mod clock;
pub mod emulator;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use emulator::Emulator;
pub use error::EmulatorError;
