//! # bpod-protocol
//!
//! Wire protocol for the bpod state machine controller.
//!
//! This crate provides:
//! - Command header bytes and runtime opcodes
//! - Little-endian encoding of outgoing commands
//! - Typed decoding of device responses with underrun detection
//! - The byte-stream `Transport` abstraction, an in-memory transport and
//!   (with the `serial` feature) a serial port transport

pub mod codec;
pub mod error;
pub mod header;
pub mod transport;

#[cfg(feature = "serial")]
pub mod serial;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use header::{Header, Opcode};
pub use transport::{MemoryTransport, Transport};

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

/// Byte the device answers a handshake with.
pub const HANDSHAKE_ACK: u8 = b'5';

/// Event code the device appends once the state machine has exited.
pub const EVENT_END: u8 = 255;

/// Default serial baud rate of the controller.
pub const DEFAULT_BAUD_RATE: u32 = 1_312_500;
