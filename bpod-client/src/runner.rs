//! The trial loop shared by every [`DeviceLink`] backend.
//!
//! One thread polls, in turn, the command channel, the per-iteration hook
//! and the device. Nothing in the loop blocks for long: device reads happen
//! only when bytes are available and commands are drained with `try_recv`.

use crate::command::Command;
use crate::error::ClientError;
use bpod_core::{DeviceEvent, DeviceLink, RawEvents, StateMachine, Step, TrialRecorder};
use bpod_protocol::EVENT_END;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;

/// Sleep between polls that found nothing to do.
pub const IDLE_SLEEP: Duration = Duration::from_micros(250);

/// Callbacks invoked from inside the trial loop.
pub trait RunHooks {
    /// A state emitted a soft code.
    fn on_soft_code(&mut self, _code: u8) {}

    /// Called once per loop iteration, before the device is polled.
    fn on_iteration(&mut self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl RunHooks for NoHooks {}

/// Result of one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    pub raw: RawEvents,
    /// A kill command arrived; the session should disconnect.
    pub killed: bool,
    /// The device closed the byte stream before the trial ended.
    pub closed: bool,
}

#[derive(Debug, Default)]
struct LoopFlags {
    paused: bool,
    stop_requested: bool,
    stop_sent: bool,
    killed: bool,
    commands_closed: bool,
    link_closed: bool,
}

/// Runs the installed program once and collects the trial data.
///
/// The program compiled from `sma` must already be uploaded to `link`.
pub fn run_trial<L>(
    link: &mut L,
    sma: &StateMachine,
    mut commands: Option<&mut UnboundedReceiver<Command>>,
    hooks: &mut dyn RunHooks,
) -> Result<TrialOutcome, ClientError>
where
    L: DeviceLink,
    ClientError: From<L::Error>,
{
    link.start_trial(sma)?;
    let mut recorder = TrialRecorder::new();
    let mut flags = LoopFlags::default();

    'run: loop {
        if let Some(rx) = commands.as_deref_mut() {
            while !flags.commands_closed {
                match rx.try_recv() {
                    Ok(command) => handle_command(link, sma, command, &mut flags)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => flags.commands_closed = true,
                }
            }
        }
        if flags.stop_requested && !flags.stop_sent {
            link.request_stop()?;
            flags.stop_sent = true;
        }

        hooks.on_iteration();
        if flags.paused {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        match link.poll_event()? {
            Some(DeviceEvent::Events(codes)) => {
                for code in codes {
                    if code == EVENT_END {
                        break 'run;
                    }
                    recorder.record_event(code);
                    let step = sma.next_step(
                        recorder.current_state(),
                        recorder.previous_state(),
                        usize::from(code),
                    );
                    if let Some(Step::Enter(next)) = step {
                        recorder.enter_state(next);
                    }
                }
            }
            Some(DeviceEvent::SoftCode(code)) => {
                tracing::debug!("Soft code {}", code);
                recorder.record_soft_code(code);
                hooks.on_soft_code(code);
            }
            Some(DeviceEvent::Closed) => {
                flags.link_closed = true;
                break 'run;
            }
            None => std::thread::sleep(IDLE_SLEEP),
        }
    }

    if flags.link_closed {
        let raw = recorder.interrupt();
        tracing::warn!(
            "Trial interrupted by closed connection after {} events",
            raw.events.len()
        );
        return Ok(TrialOutcome {
            raw,
            killed: flags.killed,
            closed: true,
        });
    }

    let timing = link.finish_trial()?;
    let raw = recorder.finish(timing)?;
    tracing::debug!(
        "Trial ended after {} events in {} states",
        raw.events.len(),
        raw.states.len()
    );
    Ok(TrialOutcome {
        raw,
        killed: flags.killed,
        closed: false,
    })
}

fn handle_command<L>(
    link: &mut L,
    sma: &StateMachine,
    command: Command,
    flags: &mut LoopFlags,
) -> Result<(), ClientError>
where
    L: DeviceLink,
    ClientError: From<L::Error>,
{
    tracing::debug!("Command: {:?}", command);
    match command {
        Command::Pause => flags.paused = true,
        Command::Resume => flags.paused = false,
        Command::Stop => flags.stop_requested = true,
        Command::Kill => {
            flags.stop_requested = true;
            flags.killed = true;
            flags.paused = false;
        }
        Command::TriggerEvent(name) => trigger_named(link, sma, &name)?,
        Command::SoftCode(n) => trigger_named(link, sma, &format!("SoftCode{}", n))?,
        Command::TriggerInput { channel, value } => {
            link.override_input(channel, value)?;
        }
        Command::TriggerOutput { channel, value } => link.override_output(channel, value)?,
        Command::LoadModuleMessage { channel, bytes } => link.send_serial(channel, &bytes)?,
    }
    Ok(())
}

fn trigger_named<L>(link: &mut L, sma: &StateMachine, name: &str) -> Result<(), ClientError>
where
    L: DeviceLink,
    ClientError: From<L::Error>,
{
    match sma.channels().event_code(name) {
        Some(code) => {
            link.trigger_event(code)?;
        }
        None => tracing::warn!("Ignoring trigger for unknown event '{}'", name),
    }
    Ok(())
}
