//! Driver for a state machine controller on a byte stream.

use crate::config::SessionConfig;
use crate::error::ClientError;
use bpod_core::{
    CompiledProgram, CoreError, DeviceEvent, DeviceLink, HardwareDescription, StateMachine,
    TrialTiming,
};
use bpod_protocol::{
    Decoder, Encoder, Header, Opcode, ProtocolError, Transport, HANDSHAKE_ACK,
};

/// A connected device.
///
/// Created by [`Device::open`], which performs the handshake and reads the
/// hardware description. Dropped or [`disconnect`](DeviceLink::disconnect)ed
/// devices release the transport.
#[derive(Debug)]
pub struct Device<T: Transport> {
    transport: Option<T>,
    hardware: HardwareDescription,
    /// Checksum of the last uploaded program.
    installed: Option<u32>,
    /// The last upload has not been acknowledged yet. The device answers
    /// only after the next run command.
    awaiting_install_ack: bool,
}

impl<T: Transport> Device<T> {
    /// Handshakes with the device and prepares it for trials.
    pub fn open(mut transport: T, settings: &SessionConfig) -> Result<Self, ClientError> {
        send(&mut transport, &Encoder::command(Header::Handshake))?;
        let ack = Decoder::new(&mut transport).read_u8()?;
        if ack != HANDSHAKE_ACK {
            return Err(ClientError::HandshakeFailed { ack });
        }

        send(&mut transport, &Encoder::command(Header::FirmwareVersion))?;
        let mut decoder = Decoder::new(&mut transport);
        let firmware_version = decoder.read_u16()?;
        let machine_type = decoder.read_u16()?;
        if firmware_version < settings.target_firmware {
            return Err(ClientError::FirmwareTooOld {
                found: firmware_version,
                target: settings.target_firmware,
            });
        }
        if firmware_version > settings.target_firmware {
            return Err(ClientError::FirmwareTooNew {
                found: firmware_version,
                target: settings.target_firmware,
            });
        }

        send(&mut transport, &Encoder::command(Header::HardwareDescription))?;
        let hardware = read_hardware(&mut transport, firmware_version, machine_type)?;
        tracing::debug!(
            "Hardware: {} states, {}us cycle, inputs {:?}, outputs {:?}",
            hardware.max_states,
            hardware.cycle_period,
            hardware.inputs,
            hardware.outputs
        );

        send(
            &mut transport,
            &Encoder::enable_ports(&settings.inputs_enabled(&hardware)),
        )?;
        if Decoder::new(&mut transport).read_u8()? == 0 {
            return Err(ClientError::PortEnableFailed);
        }

        send(
            &mut transport,
            &Encoder::sync_channel_mode(settings.sync_channel, settings.sync_mode),
        )?;
        if Decoder::new(&mut transport).read_u8()? == 0 {
            return Err(ClientError::SyncConfigFailed);
        }

        tracing::info!(
            "Connected to machine type {} with firmware {}",
            machine_type,
            firmware_version
        );
        Ok(Self {
            transport: Some(transport),
            hardware,
            installed: None,
            awaiting_install_ack: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Checksum of the last uploaded program.
    pub fn installed_checksum(&self) -> Option<u32> {
        self.installed
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Sets a digital output channel directly.
    pub fn override_digital_output(&mut self, channel: u8, value: u8) -> Result<(), ClientError> {
        self.send(&Encoder::override_digital_hw_state(channel, value))
    }

    /// Writes one byte to a hardware serial channel.
    pub fn send_to_serial(&mut self, channel: u8, byte: u8) -> Result<(), ClientError> {
        self.send(&Encoder::send_to_hw_serial(channel, byte))
    }

    fn io(&mut self) -> Result<&mut T, ClientError> {
        self.transport.as_mut().ok_or(ClientError::NotConnected)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        send(self.io()?, bytes)
    }

    fn read_ack(&mut self) -> Result<bool, ClientError> {
        Ok(Decoder::new(self.io()?).read_u8()? != 0)
    }

    fn read_report(&mut self) -> Result<Option<DeviceEvent>, ClientError> {
        let transport = self.io()?;
        if transport.bytes_available().map_err(ProtocolError::from)? == 0 {
            return Ok(None);
        }
        let mut decoder = Decoder::new(transport);
        let (opcode, data) = decoder.read_frame()?;
        match Opcode::from_byte(opcode) {
            Opcode::EventsReady => {
                let events = decoder.read_u8_array(usize::from(data))?;
                tracing::debug!("Events: {:?}", events);
                Ok(Some(DeviceEvent::Events(events)))
            }
            Opcode::SoftCode => Ok(Some(DeviceEvent::SoftCode(data))),
            Opcode::Unknown(other) => Err(ClientError::UnknownOpcode(other)),
        }
    }
}

fn send<T: Transport>(transport: &mut T, bytes: &[u8]) -> Result<(), ClientError> {
    transport.write(bytes)?;
    transport.flush()?;
    Ok(())
}

fn read_hardware<T: Transport>(
    transport: &mut T,
    firmware_version: u16,
    machine_type: u16,
) -> Result<HardwareDescription, ClientError> {
    let mut decoder = Decoder::new(transport);
    let max_states = decoder.read_u16()?;
    let cycle_period = decoder.read_u16()?;
    let events_per_serial_channel = decoder.read_u8()?;
    let n_global_timers = decoder.read_u8()?;
    let n_global_counters = decoder.read_u8()?;
    let n_conditions = decoder.read_u8()?;
    let n_inputs = decoder.read_u8()?;
    let inputs = decoder.read_chars(usize::from(n_inputs))?;
    let n_outputs = decoder.read_u8()?;
    let outputs = decoder.read_chars(usize::from(n_outputs))?;
    Ok(HardwareDescription {
        firmware_version,
        machine_type,
        max_states,
        cycle_period,
        events_per_serial_channel,
        n_global_timers,
        n_global_counters,
        n_conditions,
        inputs,
        outputs,
    })
}

impl<T: Transport> DeviceLink for Device<T> {
    type Error = ClientError;

    fn hardware(&self) -> &HardwareDescription {
        &self.hardware
    }

    fn upload(&mut self, program: &CompiledProgram) -> Result<(), ClientError> {
        let checksum = program.checksum();
        if self.installed == Some(checksum) {
            tracing::debug!("Program {:08x} already installed, skipping upload", checksum);
            return Ok(());
        }
        self.send(&Encoder::new_state_matrix(&program.table8, &program.table32))?;
        self.installed = Some(checksum);
        self.awaiting_install_ack = true;
        tracing::debug!(
            "Uploaded program {:08x}: {} states, {} bytes",
            checksum,
            program.n_states(),
            program.payload_len()
        );
        Ok(())
    }

    fn start_trial(&mut self, _sma: &StateMachine) -> Result<(), ClientError> {
        if self.installed.is_none() {
            return Err(ClientError::InvalidState("no state machine uploaded"));
        }
        self.send(&Encoder::command(Header::RunStateMachine))?;
        if self.awaiting_install_ack {
            self.awaiting_install_ack = false;
            let acked = self.read_ack();
            if !matches!(acked, Ok(true)) {
                self.installed = None;
            }
            if !acked? {
                return Err(ClientError::ProgramNotAcknowledged);
            }
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Result<Option<DeviceEvent>, ClientError> {
        match self.read_report() {
            Err(ClientError::Protocol(ProtocolError::TransportClosed)) => {
                tracing::warn!("Device closed the connection");
                self.transport = None;
                self.installed = None;
                self.awaiting_install_ack = false;
                Ok(Some(DeviceEvent::Closed))
            }
            other => other,
        }
    }

    fn request_stop(&mut self) -> Result<(), ClientError> {
        self.send(&Encoder::command(Header::ExitStateMachine))
    }

    fn finish_trial(&mut self) -> Result<TrialTiming, ClientError> {
        let mut decoder = Decoder::new(self.io()?);
        let trial_start_ms = decoder.read_u32()?;
        let n = decoder.read_u16()?;
        let ticks = decoder.read_u32_array(usize::from(n))?;
        Ok(TrialTiming {
            trial_start_timestamp: f64::from(trial_start_ms) / 1000.0,
            event_timestamps: ticks
                .into_iter()
                .map(|t| self.hardware.ticks_to_seconds(t))
                .collect(),
        })
    }

    fn trigger_event(&mut self, code: usize) -> Result<bool, ClientError> {
        tracing::warn!("Device cannot inject event {}, ignoring", code);
        Ok(false)
    }

    fn override_input(&mut self, channel: usize, value: u8) -> Result<bool, ClientError> {
        tracing::warn!(
            "Device cannot override input {} to {}, ignoring",
            channel,
            value
        );
        Ok(false)
    }

    fn override_output(&mut self, channel: usize, value: u8) -> Result<(), ClientError> {
        let channel = u8::try_from(channel).map_err(|_| CoreError::ValueOutOfRange {
            what: "output channel",
            value: channel as u64,
            max: u64::from(u8::MAX),
        })?;
        self.override_digital_output(channel, value)
    }

    fn send_serial(&mut self, channel: u8, bytes: &[u8]) -> Result<(), ClientError> {
        let mut buf = Vec::with_capacity(3 * bytes.len());
        for byte in bytes {
            buf.extend_from_slice(&Encoder::send_to_hw_serial(channel, *byte));
        }
        self.send(&buf)
    }

    fn load_serial_messages(
        &mut self,
        channel: u8,
        messages: &[(u8, &[u8])],
    ) -> Result<(), ClientError> {
        self.send(&Encoder::load_serial_messages(channel, messages)?)?;
        if !self.read_ack()? {
            return Err(ClientError::SerialMessageRejected { channel });
        }
        Ok(())
    }

    fn reset_serial_messages(&mut self) -> Result<(), ClientError> {
        self.send(&Encoder::command(Header::ResetSerialMessages))?;
        if !self.read_ack()? {
            return Err(ClientError::SerialMessageRejected { channel: 0 });
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ClientError> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        send(&mut transport, &Encoder::command(Header::Disconnect))?;
        transport.close()?;
        tracing::info!("Disconnected");
        Ok(())
    }
}
