//! Command header bytes and runtime opcodes.
//!
//! Every host request starts with a single ASCII header byte. During a
//! trial the device answers with `(opcode, data)` frames.

use std::fmt;

/// Header byte sent at the start of every host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Header {
    Handshake = b'6',
    FirmwareVersion = b'F',
    HardwareDescription = b'H',
    EnablePorts = b'E',
    SyncChannelMode = b'K',
    NewStateMatrix = b'C',
    RunStateMachine = b'R',
    /// Forces the running state machine to exit and report its data.
    ExitStateMachine = b'X',
    LoadSerialMessage = b'L',
    ResetSerialMessages = b'>',
    OverrideDigitalHwState = b'O',
    SendToHwSerial = b'U',
    Disconnect = b'Z',
}

impl Header {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        let header = match byte {
            b'6' => Header::Handshake,
            b'F' => Header::FirmwareVersion,
            b'H' => Header::HardwareDescription,
            b'E' => Header::EnablePorts,
            b'K' => Header::SyncChannelMode,
            b'C' => Header::NewStateMatrix,
            b'R' => Header::RunStateMachine,
            b'X' => Header::ExitStateMachine,
            b'L' => Header::LoadSerialMessage,
            b'>' => Header::ResetSerialMessages,
            b'O' => Header::OverrideDigitalHwState,
            b'U' => Header::SendToHwSerial,
            b'Z' => Header::Disconnect,
            _ => return None,
        };
        Some(header)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}('{}')", self, self.as_byte() as char)
    }
}

/// First byte of a runtime frame sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// `data` event codes follow.
    EventsReady,
    /// `data` is an application-defined soft code.
    SoftCode,
    /// Anything else; the protocol defines no behavior for it.
    Unknown(u8),
}

impl Opcode {
    pub const EVENTS_READY: u8 = 1;
    pub const SOFT_CODE: u8 = 2;

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            Self::EVENTS_READY => Opcode::EventsReady,
            Self::SOFT_CODE => Opcode::SoftCode,
            other => Opcode::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::EventsReady => Self::EVENTS_READY,
            Opcode::SoftCode => Self::SOFT_CODE,
            Opcode::Unknown(b) => b,
        }
    }
}
