//! The user-facing session API.

use crate::command::Command;
use crate::config::{Config, SessionConfig};
use crate::device::Device;
use crate::error::ClientError;
use crate::runner::{run_trial, NoHooks, RunHooks};
use bpod_core::{ChannelMap, DeviceLink, HardwareDescription, StateMachine, Trial};
use bpod_emulator::Emulator;
use bpod_protocol::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Every trial run over one connection.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub started_at: DateTime<Utc>,
    pub trials: Vec<Trial>,
}

impl Session {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            trials: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        serde_json::to_string_pretty(self).map_err(|e| bpod_core::CoreError::from(e).into())
    }
}

/// A connection to a state machine controller, real or emulated.
///
/// ```ignore
/// let mut bpod = Bpod::emulated(&Config::default());
/// let mut sma = bpod.new_state_machine();
/// sma.add_state("Wait", 1.0, &[("Tup", "exit")], &[])?;
/// bpod.send_state_machine(&mut sma)?;
/// let trial = bpod.run_state_machine(&sma)?;
/// ```
#[derive(Debug)]
pub struct Bpod<L: DeviceLink> {
    link: L,
    channels: Arc<ChannelMap>,
    session: Session,
    commands: Option<UnboundedReceiver<Command>>,
    /// Checksum of the last program sent with `send_state_machine`.
    sent: Option<u32>,
    connected: bool,
}

impl<T: Transport> Bpod<Device<T>> {
    /// Opens a session over an already connected byte stream.
    pub fn open(transport: T, settings: &SessionConfig) -> Result<Self, ClientError> {
        Ok(Self::from_link(Device::open(transport, settings)?))
    }
}

#[cfg(feature = "serial")]
impl Bpod<Device<bpod_protocol::SerialTransport>> {
    /// Opens the serial port named in the configuration.
    pub fn open_serial(config: &Config) -> Result<Self, ClientError> {
        let port = config.serial.port.as_deref().ok_or_else(|| {
            crate::config::ConfigError::ValidationError("serial.port is not set".to_string())
        })?;
        tracing::info!("Opening {} at {} baud", port, config.serial.baud_rate);
        let transport = bpod_protocol::SerialTransport::open(
            port,
            config.serial.baud_rate,
            config.serial.read_timeout(),
        )?;
        Self::open(transport, &config.session)
    }
}

impl Bpod<Emulator> {
    /// Starts a session against the software emulator.
    pub fn emulated(config: &Config) -> Self {
        let channels = Arc::new(ChannelMap::new(config.emulator.hardware.clone()));
        tracing::info!("Using emulator");
        Self::from_link(Emulator::new(channels))
    }
}

impl<L> Bpod<L>
where
    L: DeviceLink,
    ClientError: From<L::Error>,
{
    pub fn from_link(link: L) -> Self {
        let channels = Arc::new(ChannelMap::new(link.hardware().clone()));
        Self {
            link,
            channels,
            session: Session::new(),
            commands: None,
            sent: None,
            connected: true,
        }
    }

    /// Routes commands from `rx` into every following trial.
    pub fn with_commands(mut self, rx: UnboundedReceiver<Command>) -> Self {
        self.commands = Some(rx);
        self
    }

    pub fn hardware(&self) -> &HardwareDescription {
        self.link.hardware()
    }

    pub fn channels(&self) -> &Arc<ChannelMap> {
        &self.channels
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// An empty state machine for this device.
    pub fn new_state_machine(&self) -> StateMachine {
        StateMachine::new(self.channels.clone())
    }

    /// Finalizes and compiles `sma`, then uploads it.
    pub fn send_state_machine(&mut self, sma: &mut StateMachine) -> Result<(), ClientError> {
        self.ensure_connected()?;
        let program = sma.compile()?;
        self.link.upload(&program)?;
        self.sent = Some(program.checksum());
        Ok(())
    }

    /// Runs the last sent program and records the trial.
    pub fn run_state_machine(&mut self, sma: &StateMachine) -> Result<&Trial, ClientError> {
        self.run_state_machine_with(sma, &mut NoHooks)
    }

    pub fn run_state_machine_with(
        &mut self,
        sma: &StateMachine,
        hooks: &mut dyn RunHooks,
    ) -> Result<&Trial, ClientError> {
        self.ensure_connected()?;
        if self.sent.is_none() || !sma.is_sealed() {
            return Err(ClientError::InvalidState(
                "send_state_machine must be called before run_state_machine",
            ));
        }

        let index = self.session.trials.len();
        tracing::info!("Starting trial {}", index + 1);
        let outcome = run_trial(&mut self.link, sma, self.commands.as_mut(), hooks)?;
        self.session
            .trials
            .push(Trial::new(index, outcome.raw, sma));

        if outcome.closed {
            tracing::warn!("Connection lost during trial {}", index + 1);
            self.disconnect()?;
        } else if outcome.killed {
            tracing::info!("Session killed after trial {}", index + 1);
            self.disconnect()?;
        }
        Ok(&self.session.trials[index])
    }

    /// Stores a message on the device for a serial module channel (from 1).
    pub fn load_serial_message(
        &mut self,
        channel: u8,
        message_id: u8,
        message: &[u8],
    ) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.link
            .load_serial_messages(channel, &[(message_id, message)])?;
        Ok(())
    }

    pub fn reset_serial_messages(&mut self) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.link.reset_serial_messages()?;
        Ok(())
    }

    /// Sets an output channel outside of a running program.
    pub fn override_digital_output(&mut self, channel: usize, value: u8) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.link.override_output(channel, value)?;
        Ok(())
    }

    /// Writes one byte to a serial module channel.
    pub fn send_to_serial(&mut self, channel: u8, byte: u8) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.link.send_serial(channel, &[byte])?;
        Ok(())
    }

    /// Ends the session. Calling it again does nothing.
    pub fn disconnect(&mut self) -> Result<(), ClientError> {
        if !self.connected {
            return Ok(());
        }
        self.link.disconnect()?;
        self.connected = false;
        tracing::info!(
            "Session closed after {} trials",
            self.session.trials.len()
        );
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }
}
