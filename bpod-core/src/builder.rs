//! Program compilation into the device's two upload tables.
//!
//! 8-bit table layout (one byte per cell):
//!
//! ```text
//! | n_states | timeout destination x n_states |
//! | input:    per state: count, (event, destination) x count |
//! | outputs:  per state: count, (channel, value) x count |
//! | gt start: per state: count, (timer, destination) x count |
//! | gt end:   per state: count, (timer, destination) x count |
//! | counter:  per state: count, (counter, destination) x count |
//! | cond:     per state: count, (condition, destination) x count |
//! | timer channels | on messages | off messages | loop modes | send events |
//! | counter attached events | condition channels | condition values |
//! ```
//!
//! The global matrices carry feature indices rather than event codes. Exit
//! destinations are encoded as `n_states` and back destinations as 255.
//!
//! 32-bit table: state timers, timer durations, timer onset delays and loop
//! intervals (all in device ticks), then counter thresholds.

use crate::error::CoreError;
use crate::state_machine::{to_u8, Destination, Matrix, StateMachine, Transition, BACK_SIGNAL};

/// A program ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    pub table8: Vec<u8>,
    pub table32: Vec<u32>,
}

impl CompiledProgram {
    pub fn n_states(&self) -> usize {
        self.table8.first().map_or(0, |n| usize::from(*n))
    }

    /// CRC32C over both tables, used to skip re-uploading an installed
    /// program.
    pub fn checksum(&self) -> u32 {
        let crc = crc32c::crc32c(&self.table8);
        self.table32
            .iter()
            .fold(crc, |crc, word| crc32c::crc32c_append(crc, &word.to_le_bytes()))
    }

    /// Size of the upload payload in bytes, excluding the header.
    pub fn payload_len(&self) -> usize {
        self.table8.len() + self.table32.len() * 4
    }
}

impl StateMachine {
    /// Builds the 8-bit table. Every forward reference must be resolved.
    pub fn build_message(&self) -> Result<Vec<u8>, CoreError> {
        let n_states = self.total_states_added();
        let n = to_u8("state count", n_states as u64)?;
        let markers = *self.channels().markers();
        let mut message = Vec::with_capacity(1 + n_states * 7);
        message.push(n);

        for state in self.states() {
            message.push(self.encode_destination(state.timeout, n)?);
        }

        self.push_matrix(&mut message, Matrix::Input, 0, n)?;
        for state in self.states() {
            message.push(to_u8("output count", state.outputs.len() as u64)?);
            for action in &state.outputs {
                message.push(to_u8("output channel", action.channel as u64)?);
                message.push(action.value);
            }
        }
        self.push_matrix(&mut message, Matrix::GlobalTimerStart, markers.global_timer_start, n)?;
        self.push_matrix(&mut message, Matrix::GlobalTimerEnd, markers.global_timer_end, n)?;
        self.push_matrix(&mut message, Matrix::GlobalCounter, markers.global_counter, n)?;
        self.push_matrix(&mut message, Matrix::Condition, markers.condition, n)?;

        let timers = self.global_timers();
        message.extend_from_slice(&timers.channels);
        message.extend_from_slice(&timers.on_messages);
        message.extend_from_slice(&timers.off_messages);
        message.extend_from_slice(&timers.loop_mode);
        message.extend_from_slice(&timers.send_events);
        message.extend_from_slice(&self.global_counters().attached_events);
        message.extend_from_slice(&self.conditions().channels);
        message.extend_from_slice(&self.conditions().values);

        tracing::debug!("Built 8-bit table: {} bytes", message.len());
        Ok(message)
    }

    /// Builds the 32-bit table.
    pub fn build_message_32_bits(&self) -> Vec<u32> {
        let hw = self.channels().hardware();
        let timers = self.global_timers();
        let ticks = |seconds: &f64| hw.seconds_to_ticks(*seconds);

        let mut message: Vec<u32> = self.states().iter().map(|s| ticks(&s.timer)).collect();
        message.extend(timers.durations.iter().map(ticks));
        message.extend(timers.on_set_delays.iter().map(ticks));
        message.extend(timers.loop_intervals.iter().map(ticks));
        message.extend_from_slice(&self.global_counters().thresholds);
        message
    }

    /// Finalizes the machine and builds both tables.
    pub fn compile(&mut self) -> Result<CompiledProgram, CoreError> {
        self.finalize()?;
        let program = CompiledProgram {
            table8: self.build_message()?,
            table32: self.build_message_32_bits(),
        };
        tracing::debug!(
            "Compiled {} states, checksum {:08x}",
            program.n_states(),
            program.checksum()
        );
        Ok(program)
    }

    fn push_matrix(
        &self,
        message: &mut Vec<u8>,
        matrix: Matrix,
        base: usize,
        n_states: u8,
    ) -> Result<(), CoreError> {
        for state in self.states() {
            let transitions: &[Transition] = state.transitions(matrix);
            message.push(to_u8("transition count", transitions.len() as u64)?);
            for t in transitions {
                message.push(to_u8("event code", t.event.saturating_sub(base) as u64)?);
                message.push(self.encode_destination(t.destination, n_states)?);
            }
        }
        Ok(())
    }

    fn encode_destination(&self, destination: Destination, n_states: u8) -> Result<u8, CoreError> {
        match destination {
            Destination::State(i) => to_u8("destination state", i as u64),
            Destination::Exit => Ok(n_states),
            Destination::Back => Ok(BACK_SIGNAL),
            Destination::Pending(sentinel) => {
                let slot = sentinel.saturating_sub(crate::state_machine::UNDECLARED_BASE) as usize;
                let name = self
                    .undeclared()
                    .get(slot)
                    .cloned()
                    .unwrap_or_else(|| sentinel.to_string());
                Err(CoreError::UndeclaredStateStillMissing { name })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelMap;
    use crate::hardware::HardwareDescription;
    use proptest::prelude::*;
    use std::sync::Arc;

    /// One timer, one counter, one condition, two ports, 1 kHz clock.
    fn tiny_hardware() -> HardwareDescription {
        HardwareDescription {
            max_states: 16,
            cycle_period: 1000,
            events_per_serial_channel: 0,
            n_global_timers: 1,
            n_global_counters: 1,
            n_conditions: 1,
            inputs: "PP".chars().collect(),
            outputs: "PP".chars().collect(),
            ..HardwareDescription::default()
        }
    }

    fn tiny() -> StateMachine {
        StateMachine::new(Arc::new(ChannelMap::new(tiny_hardware())))
    }

    #[test]
    fn test_single_state_program_layout() {
        let mut sma = tiny();
        sma.add_state("myState", 1.0, &[("Tup", "exit")], &[]).unwrap();
        let program = sma.compile().unwrap();
        assert_eq!(
            program.table8,
            vec![
                1, // n_states
                1, // timeout -> exit (n_states)
                0, // input
                0, // outputs
                0, // gt start
                0, // gt end
                0, // counter
                0, // condition
                255, 0, 0, 0, 1, // timer channel, on, off, loop, send events
                254, // counter attached event
                0, 0, // condition channel, value
            ]
        );
        assert_eq!(program.table32, vec![1000, 0, 0, 0, 0]);
        assert_eq!(program.n_states(), 1);
    }

    #[test]
    fn test_global_matrices_are_relative_to_markers() {
        let mut sma = tiny();
        // Events: Port1In Port1Out Port2In Port2Out GT1_Start GT1_End GC1_End
        // Condition1 SoftJump Tup
        sma.set_global_timer(1, 0.5, 0.25, "PWM2").unwrap();
        sma.set_global_counter(1, "Port2In", 3).unwrap();
        sma.set_condition(1, "Port1", 1).unwrap();
        sma.add_state(
            "A",
            0.0,
            &[
                ("Port2In", "B"),
                ("GlobalTimer1_Start", "B"),
                ("GlobalTimer1_End", "exit"),
                ("GlobalCounter1_End", "exit"),
                ("Condition1", "A"),
            ],
            &[("GlobalTimerTrig", 1), ("PWM1", 128)],
        )
        .unwrap();
        sma.add_state("B", 2.5, &[("Tup", "A")], &[]).unwrap();
        let program = sma.compile().unwrap();

        assert_eq!(
            program.table8,
            vec![
                2, // n_states
                0, 0, // timeouts: A never, B -> A
                1, 2, 1, 0, // input: A has Port2In -> B
                2, 2, 1, 0, 128, 0, // outputs: GlobalTimerTrig=1, PWM1=128
                1, 0, 1, 0, // gt start
                1, 0, 2, 0, // gt end -> exit
                1, 0, 2, 0, // counter -> exit
                1, 0, 0, 0, // condition -> A
                1, 1, 0, 0, 1, // timer channel PWM2, on 1, off 0, loop 0, events
                2, // counter attached to Port2In
                0, 1, // condition on Port1 high
            ]
        );
        assert_eq!(program.table32, vec![0, 2500, 500, 250, 0, 3]);
    }

    #[test]
    fn test_back_destination_encoding() {
        let mut sma = tiny().with_back_signal();
        sma.add_state("A", 1.0, &[("Tup", "back")], &[]).unwrap();
        let program = sma.compile().unwrap();
        assert_eq!(program.table8[1], 255);
    }

    #[test]
    fn test_build_rejects_pending_destinations() {
        let mut sma = tiny();
        sma.add_state("A", 1.0, &[("Tup", "Later")], &[]).unwrap();
        assert!(matches!(
            sma.build_message(),
            Err(CoreError::UndeclaredStateStillMissing { name }) if name == "Later"
        ));
        assert!(sma.compile().is_err());
    }

    #[test]
    fn test_state_count_must_fit_in_a_byte() {
        let hw = HardwareDescription {
            max_states: 300,
            ..tiny_hardware()
        };
        let mut sma = StateMachine::new(Arc::new(ChannelMap::new(hw)));
        for i in 0..256 {
            sma.add_state(&format!("S{}", i), 0.0, &[], &[]).unwrap();
        }
        assert!(matches!(
            sma.compile(),
            Err(CoreError::ValueOutOfRange { what: "state count", .. })
        ));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let mut a = tiny();
        a.add_state("A", 1.0, &[("Tup", "exit")], &[]).unwrap();
        let mut b = tiny();
        b.add_state("A", 1.0, &[("Tup", "exit")], &[]).unwrap();
        let mut c = tiny();
        c.add_state("A", 2.0, &[("Tup", "exit")], &[]).unwrap();

        let (a, b, c) = (a.compile().unwrap(), b.compile().unwrap(), c.compile().unwrap());
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
        assert_eq!(a.payload_len(), a.table8.len() + 4 * a.table32.len());
    }

    proptest! {
        #[test]
        fn prop_count_fields_match_transitions(
            links in prop::collection::vec(0usize..6, 1..12)
        ) {
            // State i moves to links[i] (mod n) on Port1In; the last state exits on Tup.
            let mut sma = tiny();
            let n = links.len();
            for (i, link) in links.iter().enumerate() {
                let target = format!("S{}", link % n);
                let mut transitions = vec![("Port1In", target.as_str())];
                if i + 1 == n {
                    transitions.push(("Tup", "exit"));
                }
                sma.add_state(&format!("S{}", i), 0.01, &transitions, &[]).unwrap();
            }
            let program = sma.compile().unwrap();
            let t8 = &program.table8;
            prop_assert_eq!(t8[0] as usize, n);
            prop_assert_eq!(t8[n] as usize, n); // last timeout exits
            let input = &t8[1 + n..];
            for (i, link) in links.iter().enumerate() {
                prop_assert_eq!(input[i * 3], 1);
                prop_assert_eq!(input[i * 3 + 1], 0);
                prop_assert_eq!(input[i * 3 + 2] as usize, link % n);
            }
            prop_assert_eq!(program.table32.len(), n + 3 + 1);
            prop_assert!(program.table32[..n].iter().all(|t| *t == 10));
        }
    }
}
