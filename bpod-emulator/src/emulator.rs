//! Firmware-equivalent evaluation of a state machine.
//!
//! Each call to [`Emulator::produce_next_opcode`] is one device cycle. Events
//! are gathered in a fixed order:
//!
//! 1. a pending soft code is reported on its own,
//! 2. the oldest manual override,
//! 3. global timers (end of active timers, then delayed starts),
//! 4. global counters (threshold check, then counting this cycle's events),
//! 5. conditions of the current state,
//! 6. the state timer.
//!
//! The batch is then applied event by event with the shared transition
//! rules. Entering a state applies its output actions; leaving the program
//! appends the end-of-trial code 255.

use crate::clock::{Clock, SystemClock};
use crate::error::EmulatorError;
use bpod_core::channels::{GLOBAL_COUNTER_RESET, GLOBAL_TIMER_CANCEL, GLOBAL_TIMER_TRIG, SOFT_CODE};
use bpod_core::state_machine::{NO_CHANNEL, NO_COUNTER_EVENT};
use bpod_core::{
    ChannelMap, CompiledProgram, CoreError, Destination, DeviceEvent, DeviceLink, EventClass,
    HardwareDescription, StateMachine, Step, TrialTiming,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// Opcode announcing a batch of events.
pub const EVENTS_READY: u8 = 1;

/// Opcode carrying a soft code.
pub const SOFT_CODE_READY: u8 = 2;

/// Event code closing a trial.
pub const END_OF_TRIAL: u8 = 255;

#[derive(Debug, Clone, Copy, Default)]
struct TimerState {
    start: f64,
    end: f64,
    triggered: bool,
    active: bool,
    loops: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct CounterState {
    count: u32,
    fired: bool,
}

/// Output channels with side effects beyond setting a level.
#[derive(Debug, Clone, Copy)]
struct MetaOutputs {
    timer_trig: Option<usize>,
    timer_cancel: Option<usize>,
    counter_reset: Option<usize>,
    soft_code: Option<usize>,
}

impl MetaOutputs {
    fn new(channels: &ChannelMap) -> Self {
        Self {
            timer_trig: channels.output_code(GLOBAL_TIMER_TRIG),
            timer_cancel: channels.output_code(GLOBAL_TIMER_CANCEL),
            counter_reset: channels.output_code(GLOBAL_COUNTER_RESET),
            soft_code: channels.output_code(SOFT_CODE),
        }
    }
}

/// State of one running trial.
#[derive(Debug)]
struct Run {
    sma: StateMachine,
    meta: MetaOutputs,
    current: usize,
    previous: Option<usize>,
    matrix_start: f64,
    state_start: f64,
    pending: Vec<u8>,
    timestamps: Vec<f64>,
    inputs: Vec<u8>,
    outputs: Vec<u8>,
    soft_code: Option<u8>,
    timers: Vec<TimerState>,
    counters: Vec<CounterState>,
    overrides: VecDeque<usize>,
    stop_requested: bool,
    finished: bool,
}

impl Run {
    fn new(sma: StateMachine, now: f64) -> Self {
        let channels = sma.channels().clone();
        let hw = channels.hardware();
        Self {
            meta: MetaOutputs::new(&channels),
            current: 0,
            previous: None,
            matrix_start: now,
            state_start: now,
            pending: Vec::new(),
            timestamps: Vec::new(),
            inputs: vec![0; hw.n_inputs()],
            outputs: vec![0; channels.n_output_channels()],
            soft_code: None,
            timers: vec![TimerState::default(); sma.global_timers().len()],
            counters: vec![CounterState::default(); sma.global_counters().thresholds.len()],
            overrides: VecDeque::new(),
            stop_requested: false,
            finished: false,
            sma,
        }
    }

    fn cycle(&mut self, now: f64) -> Option<(u8, u8)> {
        if self.finished {
            return None;
        }
        if let Some(code) = self.soft_code.take() {
            return Some((SOFT_CODE_READY, code));
        }
        if self.stop_requested {
            self.pending.push(END_OF_TRIAL);
            self.finished = true;
            return Some((EVENTS_READY, batch_len(&self.pending)));
        }

        let channels = self.sma.channels().clone();
        let markers = *channels.markers();
        let mut events: Vec<usize> = Vec::new();

        if let Some(code) = self.overrides.pop_front() {
            events.push(code);
        }

        let config = self.sma.global_timers();
        for (i, timer) in self.timers.iter_mut().enumerate() {
            if timer.active {
                if now > timer.end {
                    timer.active = false;
                    if config.send_events[i] != 0 {
                        events.push(markers.global_timer_end + i);
                    }
                    set_level(&mut self.outputs, config.channels[i], config.off_messages[i]);
                    let mode = config.loop_mode[i];
                    if mode > 0 {
                        timer.loops += 1;
                        if mode == 1 || timer.loops < u32::from(mode) {
                            timer.triggered = true;
                            timer.start = now + config.loop_intervals[i];
                            timer.end = timer.start + config.durations[i];
                        }
                    }
                }
            } else if timer.triggered && now > timer.start {
                timer.triggered = false;
                timer.active = true;
                if config.send_events[i] != 0 {
                    events.push(markers.global_timer_start + i);
                }
                set_level(&mut self.outputs, config.channels[i], config.on_messages[i]);
            }
        }

        let counters = self.sma.global_counters();
        for (i, counter) in self.counters.iter_mut().enumerate() {
            let attached = counters.attached_events[i];
            if attached == NO_COUNTER_EVENT {
                continue;
            }
            if !counter.fired && counter.count == counters.thresholds[i] {
                events.push(markers.global_counter + i);
                counter.fired = true;
            }
            let seen = events.iter().filter(|e| **e == usize::from(attached)).count();
            counter.count = counter.count.saturating_add(seen as u32);
        }

        if let Some(state) = self.sma.state(self.current) {
            let conditions = self.sma.conditions();
            for t in &state.condition {
                let Some(EventClass::Condition(i)) = channels.event_class(t.event) else {
                    continue;
                };
                if t.destination == Destination::State(self.current)
                    || events.contains(&t.event)
                {
                    continue;
                }
                let channel = usize::from(conditions.channels[i]);
                if self.inputs.get(channel) == Some(&conditions.values[i]) {
                    events.push(t.event);
                }
            }
            if state.has_timeout(self.current) && now - self.state_start > state.timer {
                events.push(markers.tup);
            }
        }

        if events.is_empty() {
            return None;
        }

        for code in events {
            let Ok(byte) = u8::try_from(code) else {
                tracing::warn!("Event code {} does not fit the wire format", code);
                continue;
            };
            self.pending.push(byte);
            self.timestamps.push(now - self.matrix_start);
            if let Some(level) = channels.input_level(code) {
                if let Some(slot) = self.inputs.get_mut(level.channel) {
                    *slot = level.level;
                }
            }
            match self.sma.next_step(self.current, self.previous, code) {
                Some(Step::Enter(next)) => self.enter_state(next, now),
                Some(Step::Exit) => {
                    self.pending.push(END_OF_TRIAL);
                    self.finished = true;
                    break;
                }
                None => {}
            }
        }
        Some((EVENTS_READY, batch_len(&self.pending)))
    }

    fn enter_state(&mut self, next: usize, now: f64) {
        tracing::debug!("Emulator state {} -> {} at {:.4}s", self.current, next, now - self.matrix_start);
        self.previous = Some(self.current);
        self.current = next;
        self.state_start = now;
        self.apply_outputs(now);
    }

    /// Applies the current state's output actions. Channels not set by the
    /// state return to 0 unless an active global timer drives them.
    fn apply_outputs(&mut self, now: f64) {
        let Some(state) = self.sma.state(self.current) else {
            return;
        };
        let actions = state.outputs.clone();

        let timer_channels = &self.sma.global_timers().channels;
        for (channel, level) in self.outputs.iter_mut().enumerate() {
            let driven = self.timers.iter().zip(timer_channels).any(|(t, c)| {
                t.active && *c != NO_CHANNEL && usize::from(*c) == channel
            });
            if !driven {
                *level = 0;
            }
        }

        for action in actions {
            let channel = Some(action.channel);
            if channel == self.meta.timer_trig {
                self.trigger_timer(action.value, now);
            } else if channel == self.meta.timer_cancel {
                self.cancel_timer(action.value);
            } else if channel == self.meta.counter_reset {
                if let Some(counter) = slot(&mut self.counters, action.value) {
                    *counter = CounterState::default();
                }
            } else if channel == self.meta.soft_code {
                if action.value > 0 {
                    self.soft_code = Some(action.value);
                }
            } else if let Some(level) = self.outputs.get_mut(action.channel) {
                *level = action.value;
            }
        }
    }

    fn trigger_timer(&mut self, id: u8, now: f64) {
        let config = self.sma.global_timers();
        let Some(timer) = slot(&mut self.timers, id) else {
            tracing::warn!("GlobalTimerTrig with invalid timer id {}", id);
            return;
        };
        let i = usize::from(id) - 1;
        timer.loops = 0;
        if config.on_set_delays[i] == 0.0 {
            timer.triggered = false;
            timer.active = true;
            timer.end = now + config.durations[i];
            set_level(&mut self.outputs, config.channels[i], config.on_messages[i]);
        } else {
            timer.triggered = true;
            timer.active = false;
            timer.start = now + config.on_set_delays[i];
            timer.end = timer.start + config.durations[i];
        }
    }

    fn cancel_timer(&mut self, id: u8) {
        let config = self.sma.global_timers();
        if let Some(timer) = slot(&mut self.timers, id) {
            let was_active = timer.active;
            timer.active = false;
            timer.triggered = false;
            if was_active {
                let i = usize::from(id) - 1;
                set_level(&mut self.outputs, config.channels[i], config.off_messages[i]);
            }
        }
    }
}

/// Element `id` (1-based) of a per-feature table.
fn slot<T>(items: &mut [T], id: u8) -> Option<&mut T> {
    usize::from(id).checked_sub(1).and_then(|i| items.get_mut(i))
}

fn set_level(outputs: &mut [u8], channel: u8, value: u8) {
    if channel == NO_CHANNEL {
        return;
    }
    if let Some(level) = outputs.get_mut(usize::from(channel)) {
        *level = value;
    }
}

fn batch_len(events: &[u8]) -> u8 {
    u8::try_from(events.len()).unwrap_or(u8::MAX)
}

// ============================================================================
// Emulator
// ============================================================================

/// Software stand-in for the device.
#[derive(Debug)]
pub struct Emulator<C: Clock = SystemClock> {
    channels: Arc<ChannelMap>,
    clock: C,
    run: Option<Run>,
    installed: Option<u32>,
}

impl Emulator<SystemClock> {
    pub fn new(channels: Arc<ChannelMap>) -> Self {
        Self::with_clock(channels, SystemClock::new())
    }
}

impl<C: Clock> Emulator<C> {
    pub fn with_clock(channels: Arc<ChannelMap>, clock: C) -> Self {
        Self {
            channels,
            clock,
            run: None,
            installed: None,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelMap> {
        &self.channels
    }

    /// Checksum of the last uploaded program.
    pub fn installed_checksum(&self) -> Option<u32> {
        self.installed
    }

    /// Starts a trial of `sma` in state 0 at the current time.
    pub fn initialize(&mut self, sma: &StateMachine) -> Result<(), EmulatorError> {
        let mut sma = sma.clone();
        sma.finalize()?;
        if sma.total_states_added() == 0 {
            return Err(CoreError::InvalidDefinition {
                reason: "program has no states".to_string(),
            }
            .into());
        }
        let now = self.clock.now();
        let mut run = Run::new(sma, now);
        run.apply_outputs(now);
        self.run = Some(run);
        tracing::debug!("Emulator initialized at {:.4}s", now);
        Ok(())
    }

    fn run(&self) -> Result<&Run, EmulatorError> {
        self.run.as_ref().ok_or(EmulatorError::NotInitialized)
    }

    fn run_mut(&mut self) -> Result<&mut Run, EmulatorError> {
        self.run.as_mut().ok_or(EmulatorError::NotInitialized)
    }

    /// Runs one device cycle. Returns `(opcode, data)` when there is
    /// something to report: `(1, n)` for `n` events waiting in
    /// [`take_events`](Self::take_events), `(2, code)` for a soft code.
    pub fn produce_next_opcode(&mut self) -> Result<Option<(u8, u8)>, EmulatorError> {
        let now = self.clock.now();
        Ok(self.run_mut()?.cycle(now))
    }

    /// Drains the events announced so far.
    pub fn take_events(&mut self) -> Result<Vec<u8>, EmulatorError> {
        Ok(std::mem::take(&mut self.run_mut()?.pending))
    }

    pub fn current_state(&self) -> Result<usize, EmulatorError> {
        Ok(self.run()?.current)
    }

    /// Queues an event to be reported on a later cycle, one per cycle.
    pub fn add_manual_override_event(&mut self, code: usize) -> Result<(), EmulatorError> {
        let n_events = self.channels.n_events();
        let run = self.run_mut()?;
        if code >= n_events {
            return Err(EmulatorError::UnknownEvent {
                event: code.to_string(),
            });
        }
        run.overrides.push_back(code);
        Ok(())
    }

    pub fn add_manual_override_event_by_name(&mut self, name: &str) -> Result<(), EmulatorError> {
        self.run()?;
        let code = self
            .channels
            .event_code(name)
            .ok_or_else(|| EmulatorError::UnknownEvent {
                event: name.to_string(),
            })?;
        self.add_manual_override_event(code)
    }

    /// Forces an input level. Digital channels also report the matching
    /// `In`/`Out` event.
    pub fn override_input_state(&mut self, channel: usize, value: u8) -> Result<(), EmulatorError> {
        let event = self.channels.input_event_code(channel, value);
        let run = self.run_mut()?;
        let level = run
            .inputs
            .get_mut(channel)
            .ok_or(EmulatorError::UnknownChannel { channel })?;
        *level = value;
        if let Some(code) = event {
            run.overrides.push_back(code);
        }
        Ok(())
    }

    pub fn override_output_state(&mut self, channel: usize, value: u8) -> Result<(), EmulatorError> {
        let run = self.run_mut()?;
        let level = run
            .outputs
            .get_mut(channel)
            .ok_or(EmulatorError::UnknownChannel { channel })?;
        *level = value;
        Ok(())
    }

    pub fn input_state(&self) -> Result<&[u8], EmulatorError> {
        Ok(&self.run()?.inputs)
    }

    pub fn output_state(&self) -> Result<&[u8], EmulatorError> {
        Ok(&self.run()?.outputs)
    }

    /// Event timestamps in seconds since trial start.
    pub fn timestamps(&self) -> Result<&[f64], EmulatorError> {
        Ok(&self.run()?.timestamps)
    }

    pub fn matrix_start_time(&self) -> Result<f64, EmulatorError> {
        Ok(self.run()?.matrix_start)
    }

    /// Ends the trial on the next cycle.
    pub fn stop(&mut self) -> Result<(), EmulatorError> {
        self.run_mut()?.stop_requested = true;
        Ok(())
    }

    pub fn is_finished(&self) -> Result<bool, EmulatorError> {
        Ok(self.run()?.finished)
    }
}

impl<C: Clock> DeviceLink for Emulator<C> {
    type Error = EmulatorError;

    fn hardware(&self) -> &HardwareDescription {
        self.channels.hardware()
    }

    fn upload(&mut self, program: &CompiledProgram) -> Result<(), EmulatorError> {
        self.installed = Some(program.checksum());
        tracing::debug!(
            "Emulator received program: {} states, {} bytes",
            program.n_states(),
            program.payload_len()
        );
        Ok(())
    }

    fn start_trial(&mut self, sma: &StateMachine) -> Result<(), EmulatorError> {
        self.initialize(sma)
    }

    fn poll_event(&mut self) -> Result<Option<DeviceEvent>, EmulatorError> {
        match self.produce_next_opcode()? {
            Some((EVENTS_READY, _)) => Ok(Some(DeviceEvent::Events(self.take_events()?))),
            Some((SOFT_CODE_READY, code)) => Ok(Some(DeviceEvent::SoftCode(code))),
            _ => Ok(None),
        }
    }

    fn request_stop(&mut self) -> Result<(), EmulatorError> {
        self.stop()
    }

    fn finish_trial(&mut self) -> Result<TrialTiming, EmulatorError> {
        let run = self.run()?;
        Ok(TrialTiming {
            trial_start_timestamp: run.matrix_start,
            event_timestamps: run.timestamps.clone(),
        })
    }

    fn trigger_event(&mut self, code: usize) -> Result<bool, EmulatorError> {
        self.add_manual_override_event(code)?;
        Ok(true)
    }

    fn override_input(&mut self, channel: usize, value: u8) -> Result<bool, EmulatorError> {
        self.override_input_state(channel, value)?;
        Ok(true)
    }

    fn override_output(&mut self, channel: usize, value: u8) -> Result<(), EmulatorError> {
        self.override_output_state(channel, value)
    }

    fn send_serial(&mut self, channel: u8, bytes: &[u8]) -> Result<(), EmulatorError> {
        tracing::debug!("Emulator serial channel {}: {:?}", channel, bytes);
        Ok(())
    }

    fn load_serial_messages(
        &mut self,
        channel: u8,
        messages: &[(u8, &[u8])],
    ) -> Result<(), EmulatorError> {
        tracing::debug!(
            "Emulator stored {} serial messages for channel {}",
            messages.len(),
            channel
        );
        Ok(())
    }

    fn reset_serial_messages(&mut self) -> Result<(), EmulatorError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), EmulatorError> {
        self.run = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn channels(hw: HardwareDescription) -> Arc<ChannelMap> {
        Arc::new(ChannelMap::new(hw))
    }

    fn default_channels() -> Arc<ChannelMap> {
        channels(HardwareDescription::default())
    }

    fn emulator(map: &Arc<ChannelMap>) -> (Emulator<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (Emulator::with_clock(map.clone(), clock.clone()), clock)
    }

    fn code(map: &ChannelMap, name: &str) -> u8 {
        map.event_code(name).unwrap() as u8
    }

    /// Two states bouncing forever on their timers, leaving on counter 1.
    fn ping_pong(map: &Arc<ChannelMap>, threshold: u32) -> StateMachine {
        let mut sma = StateMachine::new(map.clone());
        sma.set_global_counter(1, "Port1In", threshold).unwrap();
        sma.add_state(
            "Ping",
            1.0,
            &[("Tup", "Pong"), ("GlobalCounter1_End", "exit")],
            &[],
        )
        .unwrap();
        sma.add_state(
            "Pong",
            1.0,
            &[("Tup", "Ping"), ("GlobalCounter1_End", "exit")],
            &[],
        )
        .unwrap();
        sma
    }

    #[test]
    fn test_every_method_requires_initialize() {
        let map = default_channels();
        let (mut emu, _) = emulator(&map);
        let not_init = |r: Result<(), EmulatorError>| matches!(r, Err(EmulatorError::NotInitialized));

        assert!(not_init(emu.produce_next_opcode().map(|_| ())));
        assert!(not_init(emu.take_events().map(|_| ())));
        assert!(not_init(emu.current_state().map(|_| ())));
        assert!(not_init(emu.add_manual_override_event(0)));
        assert!(not_init(emu.add_manual_override_event_by_name("Port1In")));
        assert!(not_init(emu.override_input_state(0, 1)));
        assert!(not_init(emu.override_output_state(0, 1)));
        assert!(not_init(emu.input_state().map(|_| ())));
        assert!(not_init(emu.output_state().map(|_| ())));
        assert!(not_init(emu.timestamps().map(|_| ())));
        assert!(not_init(emu.matrix_start_time().map(|_| ())));
        assert!(not_init(emu.stop()));
        assert!(not_init(emu.is_finished().map(|_| ())));
        assert!(not_init(emu.poll_event().map(|_| ())));
        assert!(not_init(emu.finish_trial().map(|_| ())));
    }

    #[test]
    fn test_one_state_program_times_out_once() {
        let hw = HardwareDescription {
            cycle_period: 1000,
            ..HardwareDescription::default()
        };
        let map = channels(hw);
        let (mut emu, clock) = emulator(&map);
        let mut sma = StateMachine::new(map.clone());
        sma.add_state("myState", 1.0, &[("Tup", "exit")], &[]).unwrap();
        emu.initialize(&sma).unwrap();

        assert_eq!(emu.produce_next_opcode().unwrap(), None);
        clock.set(1.0);
        assert_eq!(emu.produce_next_opcode().unwrap(), None);
        clock.set(1.001);
        assert_eq!(emu.produce_next_opcode().unwrap(), Some((EVENTS_READY, 2)));
        assert_eq!(emu.take_events().unwrap(), vec![map.tup() as u8, END_OF_TRIAL]);
        assert_eq!(emu.timestamps().unwrap().len(), 1);
        assert!((emu.timestamps().unwrap()[0] - 1.001).abs() < 1e-9);
        assert_eq!(emu.current_state().unwrap(), 0);
        assert!(emu.is_finished().unwrap());
        assert_eq!(emu.produce_next_opcode().unwrap(), None);
    }

    fn inject_and_poll(emu: &mut Emulator<ManualClock>, map: &ChannelMap, presses: u32) {
        let port1 = usize::from(code(map, "Port1In"));
        for _ in 0..presses {
            emu.add_manual_override_event(port1).unwrap();
        }
        for _ in 0..presses + 2 {
            if emu.produce_next_opcode().unwrap().is_some() {
                emu.take_events().unwrap();
            }
        }
    }

    #[test]
    fn test_global_counter_breaks_loop_at_threshold() {
        let map = default_channels();
        let (mut emu, _) = emulator(&map);
        emu.initialize(&ping_pong(&map, 5)).unwrap();
        inject_and_poll(&mut emu, &map, 5);
        assert!(emu.is_finished().unwrap());
    }

    #[test]
    fn test_global_counter_below_threshold_keeps_running() {
        let map = default_channels();
        let (mut emu, _) = emulator(&map);
        emu.initialize(&ping_pong(&map, 5)).unwrap();
        inject_and_poll(&mut emu, &map, 4);
        assert!(!emu.is_finished().unwrap());
        assert_eq!(emu.current_state().unwrap(), 0);
    }

    #[test]
    fn test_counter_fires_the_cycle_after_threshold() {
        let map = default_channels();
        let (mut emu, _) = emulator(&map);
        emu.initialize(&ping_pong(&map, 1)).unwrap();
        emu.add_manual_override_event_by_name("Port1In").unwrap();

        assert_eq!(emu.produce_next_opcode().unwrap(), Some((EVENTS_READY, 1)));
        assert_eq!(emu.take_events().unwrap(), vec![code(&map, "Port1In")]);
        assert_eq!(emu.produce_next_opcode().unwrap(), Some((EVENTS_READY, 2)));
        assert_eq!(
            emu.take_events().unwrap(),
            vec![code(&map, "GlobalCounter1_End"), END_OF_TRIAL]
        );
    }

    #[test]
    fn test_global_timer_onset_delay() {
        let map = default_channels();
        let (mut emu, clock) = emulator(&map);
        let mut sma = StateMachine::new(map.clone());
        sma.set_global_timer(1, 3.0, 1.5, "PWM2").unwrap();
        sma.add_state(
            "Trigger",
            10.0,
            &[("GlobalTimer1_End", "exit")],
            &[("GlobalTimerTrig", 1)],
        )
        .unwrap();
        emu.initialize(&sma).unwrap();
        let pwm2 = map.output_code("PWM2").unwrap();

        clock.set(1.4);
        assert_eq!(emu.produce_next_opcode().unwrap(), None);
        assert_eq!(emu.output_state().unwrap()[pwm2], 0);

        clock.set(1.501);
        assert_eq!(emu.produce_next_opcode().unwrap(), Some((EVENTS_READY, 1)));
        assert_eq!(
            emu.take_events().unwrap(),
            vec![code(&map, "GlobalTimer1_Start")]
        );
        assert_eq!(emu.output_state().unwrap()[pwm2], 1);

        clock.set(4.49);
        assert_eq!(emu.produce_next_opcode().unwrap(), None);

        clock.set(4.51);
        assert_eq!(emu.produce_next_opcode().unwrap(), Some((EVENTS_READY, 2)));
        assert_eq!(
            emu.take_events().unwrap(),
            vec![code(&map, "GlobalTimer1_End"), END_OF_TRIAL]
        );
        assert_eq!(emu.output_state().unwrap()[pwm2], 0);
        let ts = emu.timestamps().unwrap();
        assert!((ts[0] - 1.501).abs() < 1e-9);
        assert!((ts[1] - 4.51).abs() < 1e-9);
    }

    #[test]
    fn test_immediate_timer_has_no_start_event() {
        let map = default_channels();
        let (mut emu, clock) = emulator(&map);
        let mut sma = StateMachine::new(map.clone());
        sma.set_global_timer(1, 0.5, 0.0, "BNC1").unwrap();
        sma.add_state(
            "Trigger",
            10.0,
            &[("GlobalTimer1_End", "exit")],
            &[("GlobalTimerTrig", 1)],
        )
        .unwrap();
        emu.initialize(&sma).unwrap();
        assert_eq!(emu.output_state().unwrap()[map.output_code("BNC1").unwrap()], 1);

        clock.set(0.6);
        assert_eq!(emu.produce_next_opcode().unwrap(), Some((EVENTS_READY, 2)));
        assert_eq!(
            emu.take_events().unwrap(),
            vec![code(&map, "GlobalTimer1_End"), END_OF_TRIAL]
        );
    }

    #[test]
    fn test_cancelled_timer_never_ends() {
        let map = default_channels();
        let (mut emu, clock) = emulator(&map);
        let mut sma = StateMachine::new(map.clone());
        sma.set_global_timer(1, 0.5, 0.0, "BNC1").unwrap();
        sma.add_state(
            "Trigger",
            0.1,
            &[("Tup", "Cancel")],
            &[("GlobalTimerTrig", 1)],
        )
        .unwrap();
        sma.add_state(
            "Cancel",
            1.0,
            &[("GlobalTimer1_End", "exit"), ("Tup", "exit")],
            &[("GlobalTimerCancel", 1)],
        )
        .unwrap();
        emu.initialize(&sma).unwrap();

        clock.set(0.2);
        emu.produce_next_opcode().unwrap();
        assert_eq!(emu.take_events().unwrap(), vec![map.tup() as u8]);
        assert_eq!(emu.current_state().unwrap(), 1);

        clock.set(0.8);
        assert_eq!(emu.produce_next_opcode().unwrap(), None);
        clock.set(1.3);
        emu.produce_next_opcode().unwrap();
        assert_eq!(emu.take_events().unwrap(), vec![map.tup() as u8, END_OF_TRIAL]);
    }

    #[test]
    fn test_looping_timer_restarts() {
        let map = default_channels();
        let (mut emu, clock) = emulator(&map);
        let mut sma = StateMachine::new(map.clone());
        sma.configure_global_timer(
            1,
            bpod_core::GlobalTimer::new(1.0)
                .with_on_set_delay(0.5)
                .with_loop(1, 0.45),
        )
        .unwrap();
        sma.add_state("Run", 100.0, &[], &[("GlobalTimerTrig", 1)])
            .unwrap();
        emu.initialize(&sma).unwrap();
        let start = code(&map, "GlobalTimer1_Start");
        let end = code(&map, "GlobalTimer1_End");

        let mut seen = Vec::new();
        for step in 1..=58 {
            clock.set(f64::from(step) * 0.1 + 0.05);
            if emu.produce_next_opcode().unwrap().is_some() {
                seen.extend(emu.take_events().unwrap());
            }
        }
        // Starts at 0.5, 2.0, 3.5, 5.0; ends at 1.5, 3.0, 4.5.
        assert_eq!(seen, vec![start, end, start, end, start, end, start]);
    }

    #[test]
    fn test_condition_follows_input_override() {
        let map = default_channels();
        let (mut emu, _) = emulator(&map);
        let mut sma = StateMachine::new(map.clone());
        sma.set_condition(1, "Port1", 1).unwrap();
        sma.add_state("Wait", 10.0, &[("Condition1", "Done")], &[])
            .unwrap();
        sma.add_state("Done", 10.0, &[], &[]).unwrap();
        emu.initialize(&sma).unwrap();

        let port1 = map.input_channel("Port1").unwrap();
        emu.override_input_state(port1, 1).unwrap();
        assert_eq!(emu.produce_next_opcode().unwrap(), Some((EVENTS_READY, 2)));
        assert_eq!(
            emu.take_events().unwrap(),
            vec![code(&map, "Port1In"), code(&map, "Condition1")]
        );
        assert_eq!(emu.current_state().unwrap(), 1);
        assert_eq!(emu.input_state().unwrap()[port1], 1);
    }

    #[test]
    fn test_soft_code_output_is_reported_first() {
        let map = default_channels();
        let (mut emu, _) = emulator(&map);
        let mut sma = StateMachine::new(map.clone());
        sma.add_state("Play", 1.0, &[("Tup", "exit")], &[("SoftCode", 7)])
            .unwrap();
        emu.initialize(&sma).unwrap();
        assert_eq!(
            emu.poll_event().unwrap(),
            Some(DeviceEvent::SoftCode(7))
        );
        assert_eq!(emu.poll_event().unwrap(), None);
    }

    #[test]
    fn test_stop_ends_trial() {
        let map = default_channels();
        let (mut emu, _) = emulator(&map);
        emu.initialize(&ping_pong(&map, 3)).unwrap();
        emu.request_stop().unwrap();
        assert_eq!(
            emu.poll_event().unwrap(),
            Some(DeviceEvent::Events(vec![END_OF_TRIAL]))
        );
        assert!(emu.is_finished().unwrap());
        let timing = emu.finish_trial().unwrap();
        assert!(timing.event_timestamps.is_empty());
    }

    #[test]
    fn test_outputs_follow_state() {
        let map = default_channels();
        let (mut emu, clock) = emulator(&map);
        let mut sma = StateMachine::new(map.clone());
        sma.add_state("Light", 0.5, &[("Tup", "Dark")], &[("LED", 1)])
            .unwrap();
        sma.add_state("Dark", 0.5, &[("Tup", "exit")], &[]).unwrap();
        emu.initialize(&sma).unwrap();
        let pwm1 = map.output_code("PWM1").unwrap();
        assert_eq!(emu.output_state().unwrap()[pwm1], 255);

        clock.set(0.6);
        emu.produce_next_opcode().unwrap();
        assert_eq!(emu.current_state().unwrap(), 1);
        assert_eq!(emu.output_state().unwrap()[pwm1], 0);
    }

    #[test]
    fn test_unknown_override_targets() {
        let map = default_channels();
        let (mut emu, _) = emulator(&map);
        emu.initialize(&ping_pong(&map, 3)).unwrap();
        assert!(matches!(
            emu.add_manual_override_event(10_000),
            Err(EmulatorError::UnknownEvent { .. })
        ));
        assert!(matches!(
            emu.add_manual_override_event_by_name("Nope"),
            Err(EmulatorError::UnknownEvent { .. })
        ));
        assert!(matches!(
            emu.override_input_state(999, 1),
            Err(EmulatorError::UnknownChannel { channel: 999 })
        ));
    }

    proptest! {
        #[test]
        fn prop_counter_exits_iff_threshold_reached(threshold in 1u32..8, presses in 0u32..12) {
            let map = default_channels();
            let (mut emu, _) = emulator(&map);
            emu.initialize(&ping_pong(&map, threshold)).unwrap();
            inject_and_poll(&mut emu, &map, presses);
            prop_assert_eq!(emu.is_finished().unwrap(), presses >= threshold);
        }
    }
}
