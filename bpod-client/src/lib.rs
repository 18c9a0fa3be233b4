//! # bpod-client
//!
//! Host-side session runner for the bpod state machine controller.
//!
//! This crate provides:
//! - The serial [`Device`] driver: handshake, hardware discovery, program
//!   upload and the runtime frame decoder
//! - One trial loop shared by the device and the software emulator
//! - Out-of-band [`Command`]s (pause, stop, manual triggers) for a running trial
//! - YAML and environment configuration

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod runner;
pub mod session;

pub use command::Command;
pub use config::{Config, ConfigError};
pub use device::Device;
pub use error::ClientError;
pub use runner::{run_trial, NoHooks, RunHooks, TrialOutcome};
pub use session::{Bpod, Session};
