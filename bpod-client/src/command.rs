//! Out-of-band commands for a running trial.
//!
//! Commands arrive on a `tokio::sync::mpsc` channel and are drained without
//! blocking once per loop iteration. The text form is what an operator
//! types on stdin:
//!
//! ```text
//! pause | resume | stop | kill | close
//! SoftCode3
//! trigger_input:<channel>:<value>
//! trigger_output:<channel>:<value>
//! message:<channel>:<byte> <byte> ...
//! event:<name>
//! ```

use std::fmt;
use std::str::FromStr;

/// A command for the run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop handling device reports until resumed. The device keeps running.
    Pause,
    Resume,
    /// End the trial early. Timestamps are still read.
    Stop,
    /// End the trial early and disconnect afterwards.
    Kill,
    /// Inject a named event.
    TriggerEvent(String),
    /// Force an input channel level.
    TriggerInput { channel: usize, value: u8 },
    /// Force an output channel level.
    TriggerOutput { channel: usize, value: u8 },
    /// Send raw bytes to a serial module (channel numbered from 1).
    LoadModuleMessage { channel: u8, bytes: Vec<u8> },
    /// Inject the `SoftCodeN` event.
    SoftCode(u8),
}

/// A command line that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCommandError(String);

impl fmt::Display for ParseCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized command '{}'", self.0)
    }
}

impl std::error::Error for ParseCommandError {}

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let err = || ParseCommandError(line.to_string());

        match line.to_lowercase().as_str() {
            "pause" => return Ok(Command::Pause),
            "resume" => return Ok(Command::Resume),
            "stop" => return Ok(Command::Stop),
            "kill" | "close" => return Ok(Command::Kill),
            _ => {}
        }

        if let Some(n) = line.strip_prefix("SoftCode") {
            return n.parse().map(Command::SoftCode).map_err(|_| err());
        }

        let (verb, rest) = line.split_once(':').ok_or_else(err)?;
        match verb {
            "event" if !rest.is_empty() => Ok(Command::TriggerEvent(rest.to_string())),
            "trigger_input" | "trigger_output" => {
                let (channel, value) = rest.split_once(':').ok_or_else(err)?;
                let channel = channel.trim().parse().map_err(|_| err())?;
                let value = value.trim().parse().map_err(|_| err())?;
                Ok(if verb == "trigger_input" {
                    Command::TriggerInput { channel, value }
                } else {
                    Command::TriggerOutput { channel, value }
                })
            }
            "message" => {
                let (channel, bytes) = rest.split_once(':').ok_or_else(err)?;
                let channel = channel.trim().parse().map_err(|_| err())?;
                let bytes = bytes
                    .split_whitespace()
                    .map(str::parse)
                    .collect::<Result<Vec<u8>, _>>()
                    .map_err(|_| err())?;
                Ok(Command::LoadModuleMessage { channel, bytes })
            }
            _ => Err(err()),
        }
    }
}
