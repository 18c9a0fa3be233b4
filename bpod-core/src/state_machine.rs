//! State machine model.
//!
//! A [`StateMachine`] is built incrementally with [`StateMachine::add_state`]
//! and the global timer/counter/condition setters. States may reference
//! targets that are declared later; such references are held as
//! [`Destination::Pending`] until [`StateMachine::finalize`] rewrites them and
//! seals the machine.

use crate::channels::{ChannelMap, EventClass, VALVE_STATE};
use crate::error::CoreError;
use std::sync::Arc;

/// Target name that ends the trial.
pub const EXIT: &str = "exit";

/// Target name that returns to the previous state (when enabled).
pub const BACK: &str = "back";

/// First sentinel handed out to forward-referenced state names.
pub const UNDECLARED_BASE: u32 = 10_000;

/// Counter attached event meaning "no event".
pub const NO_COUNTER_EVENT: u8 = 254;

/// Global timer channel meaning "drive no output".
pub const NO_CHANNEL: u8 = 255;

/// Wire encoding of [`Destination::Back`].
pub const BACK_SIGNAL: u8 = 255;

/// Where a transition leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A declared state, by index.
    State(usize),
    /// End the trial.
    Exit,
    /// Return to the state visited before the current one.
    Back,
    /// Forward reference to a name not declared yet, by sentinel.
    Pending(u32),
}

impl Destination {
    pub fn is_pending(&self) -> bool {
        matches!(self, Destination::Pending(_))
    }
}

/// An event-triggered transition. `event` is the absolute event code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub event: usize,
    pub destination: Destination,
}

/// An output channel set on state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputAction {
    pub channel: usize,
    pub value: u8,
}

/// The per-state transition tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Matrix {
    Input,
    StateTimer,
    GlobalTimerStart,
    GlobalTimerEnd,
    GlobalCounter,
    Condition,
}

impl Matrix {
    /// Matrices holding event-keyed transition lists, in upload order.
    pub const EVENT_MATRICES: [Matrix; 5] = [
        Matrix::Input,
        Matrix::GlobalTimerStart,
        Matrix::GlobalTimerEnd,
        Matrix::GlobalCounter,
        Matrix::Condition,
    ];

    fn for_class(class: EventClass) -> Option<Matrix> {
        match class {
            EventClass::Input => Some(Matrix::Input),
            EventClass::Tup => Some(Matrix::StateTimer),
            EventClass::GlobalTimerStart(_) => Some(Matrix::GlobalTimerStart),
            EventClass::GlobalTimerEnd(_) => Some(Matrix::GlobalTimerEnd),
            EventClass::GlobalCounter(_) => Some(Matrix::GlobalCounter),
            EventClass::Condition(_) => Some(Matrix::Condition),
            EventClass::Jump => None,
        }
    }
}

/// One declared state.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub name: String,
    /// Timer duration in seconds.
    pub timer: f64,
    /// Destination when the timer elapses. `State(self)` means never.
    pub timeout: Destination,
    pub input: Vec<Transition>,
    pub global_timer_start: Vec<Transition>,
    pub global_timer_end: Vec<Transition>,
    pub global_counter: Vec<Transition>,
    pub condition: Vec<Transition>,
    pub outputs: Vec<OutputAction>,
}

impl State {
    fn new(name: &str, index: usize, timer: f64) -> Self {
        Self {
            name: name.to_string(),
            timer,
            timeout: Destination::State(index),
            input: Vec::new(),
            global_timer_start: Vec::new(),
            global_timer_end: Vec::new(),
            global_counter: Vec::new(),
            condition: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Transition list of an event-keyed matrix. `StateTimer` has none.
    pub fn transitions(&self, matrix: Matrix) -> &[Transition] {
        match matrix {
            Matrix::Input => &self.input,
            Matrix::StateTimer => &[],
            Matrix::GlobalTimerStart => &self.global_timer_start,
            Matrix::GlobalTimerEnd => &self.global_timer_end,
            Matrix::GlobalCounter => &self.global_counter,
            Matrix::Condition => &self.condition,
        }
    }

    fn transitions_mut(&mut self, matrix: Matrix) -> Option<&mut Vec<Transition>> {
        match matrix {
            Matrix::Input => Some(&mut self.input),
            Matrix::StateTimer => None,
            Matrix::GlobalTimerStart => Some(&mut self.global_timer_start),
            Matrix::GlobalTimerEnd => Some(&mut self.global_timer_end),
            Matrix::GlobalCounter => Some(&mut self.global_counter),
            Matrix::Condition => Some(&mut self.condition),
        }
    }

    /// Whether the state timer leads anywhere.
    pub fn has_timeout(&self, index: usize) -> bool {
        self.timeout != Destination::State(index)
    }

    fn destinations_mut(&mut self) -> impl Iterator<Item = &mut Destination> {
        std::iter::once(&mut self.timeout).chain(
            self.input
                .iter_mut()
                .chain(self.global_timer_start.iter_mut())
                .chain(self.global_timer_end.iter_mut())
                .chain(self.global_counter.iter_mut())
                .chain(self.condition.iter_mut())
                .map(|t| &mut t.destination),
        )
    }

    fn destinations(&self) -> impl Iterator<Item = Destination> + '_ {
        std::iter::once(self.timeout).chain(
            self.input
                .iter()
                .chain(self.global_timer_start.iter())
                .chain(self.global_timer_end.iter())
                .chain(self.global_counter.iter())
                .chain(self.condition.iter())
                .map(|t| t.destination),
        )
    }
}

// ============================================================================
// Global timers, counters, conditions
// ============================================================================

/// Global timer configuration, one entry per hardware timer.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalTimers {
    pub durations: Vec<f64>,
    pub on_set_delays: Vec<f64>,
    pub channels: Vec<u8>,
    pub on_messages: Vec<u8>,
    pub off_messages: Vec<u8>,
    pub loop_mode: Vec<u8>,
    pub send_events: Vec<u8>,
    pub loop_intervals: Vec<f64>,
}

impl GlobalTimers {
    fn new(n: usize) -> Self {
        Self {
            durations: vec![0.0; n],
            on_set_delays: vec![0.0; n],
            channels: vec![NO_CHANNEL; n],
            on_messages: vec![0; n],
            off_messages: vec![0; n],
            loop_mode: vec![0; n],
            send_events: vec![1; n],
            loop_intervals: vec![0.0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }
}

/// Global counter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalCounters {
    /// Absolute event code counted by each counter.
    pub attached_events: Vec<u8>,
    pub thresholds: Vec<u32>,
}

impl GlobalCounters {
    fn new(n: usize) -> Self {
        Self {
            attached_events: vec![NO_COUNTER_EVENT; n],
            thresholds: vec![0; n],
        }
    }
}

/// Condition configuration: input channel and the level it must be at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conditions {
    pub channels: Vec<u8>,
    pub values: Vec<u8>,
}

impl Conditions {
    fn new(n: usize) -> Self {
        Self {
            channels: vec![0; n],
            values: vec![0; n],
        }
    }
}

/// Global timer settings, applied with [`StateMachine::configure_global_timer`].
///
/// ```
/// use bpod_core::GlobalTimer;
///
/// let timer = GlobalTimer::new(3.0)
///     .with_on_set_delay(1.5)
///     .with_channel("PWM2");
/// assert_eq!(timer.on_message, 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalTimer {
    pub duration: f64,
    pub on_set_delay: f64,
    pub channel: Option<String>,
    pub on_message: u8,
    pub off_message: u8,
    pub loop_mode: u8,
    pub loop_interval: f64,
    pub send_events: bool,
}

impl GlobalTimer {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            on_set_delay: 0.0,
            channel: None,
            on_message: 1,
            off_message: 0,
            loop_mode: 0,
            loop_interval: 0.0,
            send_events: true,
        }
    }

    pub fn with_on_set_delay(mut self, delay: f64) -> Self {
        self.on_set_delay = delay;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_messages(mut self, on_message: u8, off_message: u8) -> Self {
        self.on_message = on_message;
        self.off_message = off_message;
        self
    }

    /// Restart the timer after it ends. `mode` 0 disables looping, 1 loops
    /// forever, larger values loop that many times.
    pub fn with_loop(mut self, mode: u8, interval: f64) -> Self {
        self.loop_mode = mode;
        self.loop_interval = interval;
        self
    }

    pub fn with_send_events(mut self, send_events: bool) -> Self {
        self.send_events = send_events;
        self
    }
}

// ============================================================================
// State machine
// ============================================================================

/// A program for the device, built state by state.
#[derive(Debug, Clone)]
pub struct StateMachine {
    channels: Arc<ChannelMap>,
    states: Vec<State>,
    undeclared: Vec<String>,
    pub(crate) global_timers: GlobalTimers,
    pub(crate) global_counters: GlobalCounters,
    pub(crate) conditions: Conditions,
    back_signal: bool,
    sealed: bool,
}

impl StateMachine {
    pub fn new(channels: Arc<ChannelMap>) -> Self {
        let hw = channels.hardware();
        let global_timers = GlobalTimers::new(hw.n_global_timers as usize);
        let global_counters = GlobalCounters::new(hw.n_global_counters as usize);
        let conditions = Conditions::new(hw.n_conditions as usize);
        Self {
            channels,
            states: Vec::new(),
            undeclared: Vec::new(),
            global_timers,
            global_counters,
            conditions,
            back_signal: false,
            sealed: false,
        }
    }

    /// Treat the target name `"back"` as "return to the previous state".
    pub fn with_back_signal(mut self) -> Self {
        self.back_signal = true;
        self
    }

    /// Declares a state, or overwrites an existing state of the same name.
    ///
    /// `transitions` maps event names to target state names. `outputs` lists
    /// output actions; `("Valve", n)` and `("LED", n)` are shorthands for
    /// `ValveState = 2^(n-1)` and `PWMn = 255`.
    ///
    /// Returns the state index.
    pub fn add_state(
        &mut self,
        name: &str,
        timer: f64,
        transitions: &[(&str, &str)],
        outputs: &[(&str, u32)],
    ) -> Result<usize, CoreError> {
        self.check_unsealed()?;
        check_duration("state timer", timer)?;

        let existing = self.state_index(name);
        let index = existing.unwrap_or(self.states.len());
        if existing.is_none() && self.states.len() >= usize::from(self.max_states()) {
            return Err(CoreError::TooManyStates {
                max: self.max_states(),
            });
        }

        // Resolve every name before touching the machine.
        let mut resolved_events = Vec::with_capacity(transitions.len());
        for (event, target) in transitions {
            let code = self
                .channels
                .event_code(event)
                .ok_or_else(|| CoreError::UnknownEvent {
                    event: event.to_string(),
                })?;
            let matrix = self
                .channels
                .event_class(code)
                .and_then(Matrix::for_class)
                .ok_or_else(|| CoreError::InvalidTransitionEvent {
                    event: event.to_string(),
                })?;
            resolved_events.push((code, matrix, *target));
        }
        let mut resolved_outputs = Vec::with_capacity(outputs.len());
        for (action, value) in outputs {
            resolved_outputs.push(self.resolve_output(action, *value)?);
        }

        let mut state = State::new(name, index, timer);
        for (event, matrix, target) in resolved_events {
            let destination = self.resolve_target(target, name, index);
            match state.transitions_mut(matrix) {
                Some(list) => list.push(Transition { event, destination }),
                None => state.timeout = destination,
            }
        }
        state.outputs = resolved_outputs;

        tracing::debug!(
            "Added state '{}' at {} ({} transitions, {} outputs)",
            name,
            index,
            transitions.len(),
            outputs.len()
        );
        match existing {
            Some(i) => self.states[i] = state,
            None => self.states.push(state),
        }
        Ok(index)
    }

    /// Configures global timer `id` (1-based) with a duration, onset delay
    /// and the output channel it drives.
    pub fn set_global_timer(
        &mut self,
        id: usize,
        duration: f64,
        on_set_delay: f64,
        channel: &str,
    ) -> Result<(), CoreError> {
        self.configure_global_timer(
            id,
            GlobalTimer::new(duration)
                .with_on_set_delay(on_set_delay)
                .with_channel(channel),
        )
    }

    /// Configures global timer `id` (1-based) from a full [`GlobalTimer`].
    pub fn configure_global_timer(&mut self, id: usize, timer: GlobalTimer) -> Result<(), CoreError> {
        self.check_unsealed()?;
        let i = self.timer_slot(id)?;
        check_duration("global timer duration", timer.duration)?;
        check_duration("global timer onset delay", timer.on_set_delay)?;
        check_duration("global timer loop interval", timer.loop_interval)?;
        let channel = match &timer.channel {
            Some(name) => {
                let code = self
                    .channels
                    .output_code(name)
                    .ok_or_else(|| CoreError::UnknownOutput {
                        output: name.clone(),
                    })?;
                to_u8("global timer channel", code as u64)?
            }
            None => NO_CHANNEL,
        };

        let timers = &mut self.global_timers;
        timers.durations[i] = timer.duration;
        timers.on_set_delays[i] = timer.on_set_delay;
        timers.channels[i] = channel;
        timers.on_messages[i] = timer.on_message;
        timers.off_messages[i] = timer.off_message;
        timers.loop_mode[i] = timer.loop_mode;
        timers.loop_intervals[i] = timer.loop_interval;
        timers.send_events[i] = u8::from(timer.send_events);
        Ok(())
    }

    /// Sets only the duration of global timer `id` (1-based).
    pub fn set_global_timer_legacy(&mut self, id: usize, duration: f64) -> Result<(), CoreError> {
        self.check_unsealed()?;
        let i = self.timer_slot(id)?;
        check_duration("global timer duration", duration)?;
        self.global_timers.durations[i] = duration;
        Ok(())
    }

    /// Attaches global counter `id` (1-based) to an event and sets the count
    /// at which it fires.
    pub fn set_global_counter(
        &mut self,
        id: usize,
        event: &str,
        threshold: u32,
    ) -> Result<(), CoreError> {
        self.check_unsealed()?;
        let available = self.channels.hardware().n_global_counters;
        if id == 0 || id > usize::from(available) {
            return Err(CoreError::InvalidCounterId { id, available });
        }
        let code = self
            .channels
            .event_code(event)
            .ok_or_else(|| CoreError::UnknownEvent {
                event: event.to_string(),
            })?;
        let code = to_u8("counter event code", code as u64)?;
        self.global_counters.attached_events[id - 1] = code;
        self.global_counters.thresholds[id - 1] = threshold;
        Ok(())
    }

    /// Makes condition `id` (1-based) true while `channel` is at `value`.
    pub fn set_condition(&mut self, id: usize, channel: &str, value: u8) -> Result<(), CoreError> {
        self.check_unsealed()?;
        let available = self.channels.hardware().n_conditions;
        if id == 0 || id > usize::from(available) {
            return Err(CoreError::InvalidConditionId { id, available });
        }
        let code = self
            .channels
            .input_channel(channel)
            .ok_or_else(|| CoreError::UnknownInputChannel {
                channel: channel.to_string(),
            })?;
        self.conditions.channels[id - 1] = to_u8("condition channel", code as u64)?;
        self.conditions.values[id - 1] = value;
        Ok(())
    }

    /// Resolves every forward reference and seals the machine.
    ///
    /// Fails without modifying anything if a referenced name was never
    /// declared. Calling it again on a sealed machine is a no-op.
    pub fn finalize(&mut self) -> Result<(), CoreError> {
        if self.sealed {
            return Ok(());
        }
        let mut resolved = Vec::with_capacity(self.undeclared.len());
        for name in &self.undeclared {
            let index = self.state_index(name).ok_or_else(|| {
                CoreError::UndeclaredStateStillMissing { name: name.clone() }
            })?;
            resolved.push(index);
        }
        for state in &mut self.states {
            for destination in state.destinations_mut() {
                if let Destination::Pending(sentinel) = *destination {
                    let slot = (sentinel - UNDECLARED_BASE) as usize;
                    if let Some(index) = resolved.get(slot) {
                        *destination = Destination::State(*index);
                    }
                }
            }
        }
        self.sealed = true;
        tracing::debug!(
            "Finalized state machine: {} states, {} forward references",
            self.states.len(),
            resolved.len()
        );
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn channels(&self) -> &Arc<ChannelMap> {
        &self.channels
    }

    /// Number of declared states.
    pub fn total_states_added(&self) -> usize {
        self.states.len()
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn state(&self, index: usize) -> Option<&State> {
        self.states.get(index)
    }

    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| s.name == name)
    }

    pub fn state_names(&self) -> Vec<&str> {
        self.states.iter().map(|s| s.name.as_str()).collect()
    }

    /// Names referenced before they were declared, in sentinel order.
    pub fn undeclared(&self) -> &[String] {
        &self.undeclared
    }

    pub fn global_timers(&self) -> &GlobalTimers {
        &self.global_timers
    }

    pub fn global_counters(&self) -> &GlobalCounters {
        &self.global_counters
    }

    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn uses_back_signal(&self) -> bool {
        self.back_signal
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether any destination is still a forward reference.
    pub fn has_pending(&self) -> bool {
        self.states
            .iter()
            .any(|s| s.destinations().any(|d| d.is_pending()))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn max_states(&self) -> u16 {
        self.channels.hardware().max_states
    }

    fn check_unsealed(&self) -> Result<(), CoreError> {
        if self.sealed {
            Err(CoreError::Sealed)
        } else {
            Ok(())
        }
    }

    fn timer_slot(&self, id: usize) -> Result<usize, CoreError> {
        let available = self.channels.hardware().n_global_timers;
        if id == 0 || id > usize::from(available) {
            return Err(CoreError::InvalidTimerId { id, available });
        }
        Ok(id - 1)
    }

    fn resolve_target(&mut self, target: &str, current: &str, index: usize) -> Destination {
        if target == EXIT {
            return Destination::Exit;
        }
        if self.back_signal && target == BACK {
            return Destination::Back;
        }
        if target == current {
            return Destination::State(index);
        }
        if let Some(i) = self.state_index(target) {
            return Destination::State(i);
        }
        let slot = match self.undeclared.iter().position(|n| n == target) {
            Some(slot) => slot,
            None => {
                self.undeclared.push(target.to_string());
                self.undeclared.len() - 1
            }
        };
        Destination::Pending(UNDECLARED_BASE + slot as u32)
    }

    fn resolve_output(&self, action: &str, value: u32) -> Result<OutputAction, CoreError> {
        let (name, value) = match action {
            "Valve" => {
                if !(1..=8).contains(&value) {
                    return Err(CoreError::ValueOutOfRange {
                        what: "valve number",
                        value: u64::from(value),
                        max: 8,
                    });
                }
                (VALVE_STATE.to_string(), 1u32 << (value - 1))
            }
            "LED" => (format!("PWM{}", value), 255),
            other => (other.to_string(), value),
        };
        let channel = self
            .channels
            .output_code(&name)
            .ok_or(CoreError::UnknownOutput { output: name })?;
        Ok(OutputAction {
            channel,
            value: to_u8("output value", u64::from(value))?,
        })
    }
}

fn check_duration(what: &'static str, value: f64) -> Result<(), CoreError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(CoreError::InvalidDuration { what, value })
    }
}

pub(crate) fn to_u8(what: &'static str, value: u64) -> Result<u8, CoreError> {
    u8::try_from(value).map_err(|_| CoreError::ValueOutOfRange {
        what,
        value,
        max: u64::from(u8::MAX),
    })
}
