//! Program definitions loaded from JSON or YAML.
//!
//! ```yaml
//! back_signal: false
//! global_counters:
//!   - { id: 1, event: Port1In, threshold: 5 }
//! states:
//!   - name: Ping
//!     timer: 0.1
//!     transitions:
//!       - { event: Tup, to: Pong }
//!       - { event: GlobalCounter1_End, to: exit }
//!     outputs:
//!       - [LED, 1]
//!   - name: Pong
//!     timer: 0.1
//!     transitions:
//!       - { event: Tup, to: Ping }
//! ```
//!
//! States are added in the listed order, so the first one is the initial
//! state.

use crate::channels::ChannelMap;
use crate::error::CoreError;
use crate::state_machine::{GlobalTimer, StateMachine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A whole program as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramDefinition {
    /// Enables the `back` target.
    #[serde(default)]
    pub back_signal: bool,

    pub states: Vec<StateDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_timers: Vec<GlobalTimerDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_counters: Vec<GlobalCounterDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionDefinition>,

    /// Free-form metadata, ignored by the builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(default)]
    pub timer: f64,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    /// `[action, value]` pairs.
    #[serde(default)]
    pub outputs: Vec<(String, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub event: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTimerDefinition {
    pub id: usize,
    pub duration: f64,
    #[serde(default)]
    pub on_set_delay: f64,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_on_message")]
    pub on_message: u8,
    #[serde(default)]
    pub off_message: u8,
    #[serde(default)]
    pub loop_mode: u8,
    #[serde(default)]
    pub loop_interval: f64,
    #[serde(default = "default_send_events")]
    pub send_events: bool,
}

fn default_on_message() -> u8 {
    1
}

fn default_send_events() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalCounterDefinition {
    pub id: usize,
    pub event: String,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionDefinition {
    pub id: usize,
    pub channel: String,
    pub value: u8,
}

impl ProgramDefinition {
    pub fn from_json_str(s: &str) -> Result<Self, CoreError> {
        let def: Self = serde_json::from_str(s)?;
        def.validate()?;
        Ok(def)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, CoreError> {
        let def: Self = serde_yaml::from_str(s)?;
        def.validate()?;
        Ok(def)
    }

    /// Structural checks that do not need a channel map.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.states.is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "program has no states".to_string(),
            });
        }
        if let Some(state) = self.states.iter().find(|s| s.name.is_empty()) {
            return Err(CoreError::InvalidDefinition {
                reason: format!("state with empty name (timer {})", state.timer),
            });
        }
        Ok(())
    }
}

impl StateMachine {
    /// Builds an unsealed machine from a definition.
    pub fn from_definition(
        channels: Arc<ChannelMap>,
        def: &ProgramDefinition,
    ) -> Result<Self, CoreError> {
        def.validate()?;
        let mut sma = StateMachine::new(channels);
        if def.back_signal {
            sma = sma.with_back_signal();
        }

        for timer in &def.global_timers {
            let mut settings = GlobalTimer::new(timer.duration)
                .with_on_set_delay(timer.on_set_delay)
                .with_messages(timer.on_message, timer.off_message)
                .with_loop(timer.loop_mode, timer.loop_interval)
                .with_send_events(timer.send_events);
            if let Some(channel) = &timer.channel {
                settings = settings.with_channel(channel.as_str());
            }
            sma.configure_global_timer(timer.id, settings)?;
        }
        for counter in &def.global_counters {
            sma.set_global_counter(counter.id, &counter.event, counter.threshold)?;
        }
        for condition in &def.conditions {
            sma.set_condition(condition.id, &condition.channel, condition.value)?;
        }

        for state in &def.states {
            let transitions: Vec<(&str, &str)> = state
                .transitions
                .iter()
                .map(|t| (t.event.as_str(), t.to.as_str()))
                .collect();
            let outputs: Vec<(&str, u32)> = state
                .outputs
                .iter()
                .map(|(action, value)| (action.as_str(), *value))
                .collect();
            sma.add_state(&state.name, state.timer, &transitions, &outputs)?;
        }

        tracing::debug!(
            "Loaded program definition with {} states",
            sma.total_states_added()
        );
        Ok(sma)
    }
}
