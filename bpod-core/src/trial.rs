//! Trial records.

use crate::error::CoreError;
use crate::link::TrialTiming;
use crate::state_machine::StateMachine;
use serde::{Deserialize, Serialize};

/// Raw data of one trial, as reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvents {
    /// Event codes in arrival order.
    pub events: Vec<u8>,
    /// Seconds since trial start, one per event.
    pub event_timestamps: Vec<f64>,
    /// Visited states, starting with 0.
    pub states: Vec<u32>,
    /// Entry time of each visited state, plus the trial end time.
    pub state_timestamps: Vec<f64>,
    /// Device clock at trial start, in seconds.
    pub trial_start_timestamp: f64,
    pub soft_codes: Vec<u8>,
    /// The byte stream closed before the trial ended. No timestamps were
    /// read back.
    #[serde(default)]
    pub interrupted: bool,
}

/// Collects events and state changes while a trial runs.
#[derive(Debug, Clone)]
pub struct TrialRecorder {
    raw: RawEvents,
    /// Event index that caused each state change.
    state_change_indexes: Vec<usize>,
}

impl Default for TrialRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrialRecorder {
    pub fn new() -> Self {
        Self {
            raw: RawEvents {
                states: vec![0],
                ..RawEvents::default()
            },
            state_change_indexes: Vec::new(),
        }
    }

    pub fn current_state(&self) -> usize {
        self.raw.states.last().map_or(0, |s| *s as usize)
    }

    pub fn previous_state(&self) -> Option<usize> {
        let n = self.raw.states.len();
        (n >= 2).then(|| self.raw.states[n - 2] as usize)
    }

    pub fn record_event(&mut self, event: u8) {
        self.raw.events.push(event);
    }

    /// Records entry into `state`, caused by the last recorded event.
    pub fn enter_state(&mut self, state: usize) {
        self.raw.states.push(state as u32);
        self.state_change_indexes
            .push(self.raw.events.len().saturating_sub(1));
    }

    pub fn record_soft_code(&mut self, code: u8) {
        self.raw.soft_codes.push(code);
    }

    pub fn events(&self) -> &[u8] {
        &self.raw.events
    }

    pub fn states(&self) -> &[u32] {
        &self.raw.states
    }

    /// Attaches the device timestamps and derives state entry times.
    pub fn finish(mut self, timing: TrialTiming) -> Result<RawEvents, CoreError> {
        if timing.event_timestamps.len() < self.raw.events.len() {
            return Err(CoreError::TimestampMismatch {
                events: self.raw.events.len(),
                timestamps: timing.event_timestamps.len(),
            });
        }
        let ts = &timing.event_timestamps;
        let mut state_timestamps = Vec::with_capacity(self.state_change_indexes.len() + 2);
        state_timestamps.push(0.0);
        for index in &self.state_change_indexes {
            state_timestamps.push(ts.get(*index).copied().unwrap_or(0.0));
        }
        state_timestamps.push(ts.last().copied().unwrap_or(0.0));

        self.raw.state_timestamps = state_timestamps;
        self.raw.trial_start_timestamp = timing.trial_start_timestamp;
        self.raw.event_timestamps = timing.event_timestamps;
        Ok(self.raw)
    }

    /// Ends a trial the device never finished. Events and states recorded
    /// so far are kept without timestamps.
    pub fn interrupt(mut self) -> RawEvents {
        self.raw.interrupted = true;
        self.raw
    }
}

/// One visit to a state: entry and exit time relative to trial start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateOccurrence {
    pub name: String,
    pub start: f64,
    pub end: f64,
}

/// One event with its time relative to trial start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOccurrence {
    pub name: String,
    pub code: u8,
    pub timestamp: f64,
}

/// A finished trial with readable names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// Zero-based position in the session.
    pub index: usize,
    pub raw: RawEvents,
    pub states: Vec<StateOccurrence>,
    pub events: Vec<EventOccurrence>,
}

impl Trial {
    pub fn new(index: usize, raw: RawEvents, sma: &StateMachine) -> Self {
        let states = raw
            .states
            .iter()
            .enumerate()
            .map(|(i, state)| StateOccurrence {
                name: sma
                    .state(*state as usize)
                    .map_or_else(|| format!("State{}", state), |s| s.name.clone()),
                start: raw.state_timestamps.get(i).copied().unwrap_or(0.0),
                end: raw.state_timestamps.get(i + 1).copied().unwrap_or(0.0),
            })
            .collect();
        let events = raw
            .events
            .iter()
            .zip(&raw.event_timestamps)
            .map(|(code, timestamp)| EventOccurrence {
                name: sma
                    .channels()
                    .event_name(usize::from(*code))
                    .map_or_else(|| format!("Event{}", code), str::to_string),
                code: *code,
                timestamp: *timestamp,
            })
            .collect();
        Self {
            index,
            raw,
            states,
            events,
        }
    }

    /// Timestamps of every occurrence of the named event.
    pub fn event_times(&self, name: &str) -> Vec<f64> {
        self.events
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.timestamp)
            .collect()
    }

    /// `(start, end)` of every visit to the named state.
    pub fn state_visits(&self, name: &str) -> Vec<(f64, f64)> {
        self.states
            .iter()
            .filter(|s| s.name == name)
            .map(|s| (s.start, s.end))
            .collect()
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelMap;
    use crate::hardware::HardwareDescription;
    use std::sync::Arc;

    #[test]
    fn test_recorder_tracks_states() {
        let mut rec = TrialRecorder::new();
        assert_eq!(rec.current_state(), 0);
        assert_eq!(rec.previous_state(), None);
        rec.record_event(3);
        rec.enter_state(2);
        assert_eq!(rec.current_state(), 2);
        assert_eq!(rec.previous_state(), Some(0));
        assert_eq!(rec.states(), &[0, 2]);
    }

    #[test]
    fn test_finish_derives_state_timestamps() {
        let mut rec = TrialRecorder::new();
        rec.record_event(10);
        rec.record_event(11);
        rec.enter_state(1);
        rec.record_event(12);
        let raw = rec
            .finish(TrialTiming {
                trial_start_timestamp: 4.5,
                event_timestamps: vec![0.1, 0.2, 0.7],
            })
            .unwrap();
        assert_eq!(raw.states, vec![0, 1]);
        assert_eq!(raw.state_timestamps, vec![0.0, 0.2, 0.7]);
        assert_eq!(raw.trial_start_timestamp, 4.5);
    }

    #[test]
    fn test_finish_rejects_missing_timestamps() {
        let mut rec = TrialRecorder::new();
        rec.record_event(1);
        rec.record_event(2);
        let err = rec
            .finish(TrialTiming {
                trial_start_timestamp: 0.0,
                event_timestamps: vec![0.5],
            })
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::TimestampMismatch {
                events: 2,
                timestamps: 1
            }
        ));
    }

    #[test]
    fn test_interrupt_keeps_recorded_data() {
        let mut rec = TrialRecorder::new();
        rec.record_event(4);
        rec.enter_state(1);
        rec.record_soft_code(2);
        let raw = rec.interrupt();
        assert!(raw.interrupted);
        assert_eq!(raw.events, vec![4]);
        assert_eq!(raw.states, vec![0, 1]);
        assert_eq!(raw.soft_codes, vec![2]);
        assert!(raw.event_timestamps.is_empty());
    }

    #[test]
    fn test_trial_names_states_and_events() {
        let channels = Arc::new(ChannelMap::new(HardwareDescription::default()));
        let mut sma = StateMachine::new(channels.clone());
        sma.add_state("Wait", 1.0, &[("Port1In", "Reward")], &[]).unwrap();
        sma.add_state("Reward", 0.1, &[("Tup", "exit")], &[]).unwrap();
        sma.finalize().unwrap();

        let port1 = channels.event_code("Port1In").unwrap() as u8;
        let tup = channels.tup() as u8;
        let mut rec = TrialRecorder::new();
        rec.record_event(port1);
        rec.enter_state(1);
        rec.record_event(tup);
        let raw = rec
            .finish(TrialTiming {
                trial_start_timestamp: 0.0,
                event_timestamps: vec![0.4, 0.5],
            })
            .unwrap();

        let trial = Trial::new(0, raw, &sma);
        assert_eq!(trial.state_visits("Wait"), vec![(0.0, 0.4)]);
        assert_eq!(trial.state_visits("Reward"), vec![(0.4, 0.5)]);
        assert_eq!(trial.event_times("Port1In"), vec![0.4]);
        assert_eq!(trial.event_times("Tup"), vec![0.5]);
        assert!(trial.to_json().unwrap().contains("\"Reward\""));
    }
}
