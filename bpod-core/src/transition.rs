//! Transition resolution.
//!
//! Both the device runner and the emulator decide state changes here, so a
//! program behaves the same whether it runs on hardware or in software.

use crate::state_machine::{Destination, Matrix, StateMachine};

/// Search order for an incoming event. The first matrix with a match wins.
pub const PRIORITY: [Matrix; 6] = [
    Matrix::Input,
    Matrix::StateTimer,
    Matrix::GlobalTimerStart,
    Matrix::GlobalTimerEnd,
    Matrix::GlobalCounter,
    Matrix::Condition,
];

/// Outcome of an event in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Enter the given state.
    Enter(usize),
    /// Leave the program.
    Exit,
}

impl StateMachine {
    /// Finds the transition taken by `event` in `state`, and the matrix it
    /// came from.
    ///
    /// Within a matrix the first registered entry for the event is used. The
    /// state timer matrix only matches `Tup` in states that actually time out.
    pub fn find_transition(&self, state: usize, event: usize) -> Option<(Matrix, Destination)> {
        let current = self.state(state)?;
        for matrix in PRIORITY {
            if matrix == Matrix::StateTimer {
                if event == self.channels().tup() && current.has_timeout(state) {
                    return Some((matrix, current.timeout));
                }
                continue;
            }
            if let Some(t) = current.transitions(matrix).iter().find(|t| t.event == event) {
                return Some((matrix, t.destination));
            }
        }
        None
    }

    /// Resolves `event` in `state` to the next step, if any.
    ///
    /// `previous` is the state visited before `state`; a back transition
    /// with no previous state stays where it is.
    pub fn next_step(&self, state: usize, previous: Option<usize>, event: usize) -> Option<Step> {
        let (matrix, destination) = self.find_transition(state, event)?;
        let step = match destination {
            Destination::State(next) => Step::Enter(next),
            Destination::Exit => Step::Exit,
            Destination::Back => Step::Enter(previous.unwrap_or(state)),
            Destination::Pending(sentinel) => {
                tracing::warn!(
                    "Unresolved forward reference {} in state {}; event {} ignored",
                    sentinel,
                    state,
                    event
                );
                return None;
            }
        };
        tracing::debug!(
            "Event {} in state {} matched {:?}: {:?}",
            event,
            state,
            matrix,
            step
        );
        Some(step)
    }
}
