//! Channel map derived from a hardware description.
//!
//! Event codes are positions in an ordered list of event names:
//!
//! ```text
//! | input events | GlobalTimerN_Start | GlobalTimerN_End | GlobalCounterN_End |
//! | ConditionN | SerialNJump ... SoftJump | Tup |
//! ```
//!
//! The device addresses events and output channels by these positions, so
//! the derivation order is part of the wire contract.

use crate::hardware::{HardwareDescription, PortType};
use serde::Serialize;
use std::collections::HashMap;

/// Name of the state-timer timeout event.
pub const TUP: &str = "Tup";

/// Output channel that triggers a global timer (value = timer id).
pub const GLOBAL_TIMER_TRIG: &str = "GlobalTimerTrig";

/// Output channel that cancels a global timer (value = timer id).
pub const GLOBAL_TIMER_CANCEL: &str = "GlobalTimerCancel";

/// Output channel that resets a global counter (value = counter id).
pub const GLOBAL_COUNTER_RESET: &str = "GlobalCounterReset";

/// Output channel carrying soft codes to the host.
pub const SOFT_CODE: &str = "SoftCode";

/// Output channel driving the SPI valve bank as a bitmask.
pub const VALVE_STATE: &str = "ValveState";

/// What kind of occurrence an event code stands for.
///
/// The payload of the global feature classes is the zero-based feature
/// index (event code minus the group marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventClass {
    Input,
    GlobalTimerStart(usize),
    GlobalTimerEnd(usize),
    GlobalCounter(usize),
    Condition(usize),
    Jump,
    Tup,
}

/// Starting offsets of the synthetic event groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventMarkers {
    pub global_timer_start: usize,
    pub global_timer_end: usize,
    pub global_counter: usize,
    pub condition: usize,
    pub jump: usize,
    pub tup: usize,
}

/// First event code and first output channel of each port family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FamilyOffsets {
    pub event_usb: Option<usize>,
    pub event_port: Option<usize>,
    pub event_bnc: Option<usize>,
    pub event_wire: Option<usize>,
    pub output_usb: Option<usize>,
    pub output_spi: Option<usize>,
    pub output_bnc: Option<usize>,
    pub output_wire: Option<usize>,
    pub output_pwm: Option<usize>,
}

/// The input channel and logic level an `In`/`Out` event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InputLevel {
    pub channel: usize,
    pub level: u8,
}

/// Named channels and event codes of a device.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    hardware: HardwareDescription,
    event_names: Vec<String>,
    event_classes: Vec<EventClass>,
    event_levels: Vec<Option<InputLevel>>,
    event_index: HashMap<String, usize>,
    /// One slot per hardware input. Valve and unrecognized inputs are
    /// unnamed.
    input_channels: Vec<Option<String>>,
    /// One slot per hardware output, then the three virtual outputs.
    /// Unrecognized outputs are unnamed.
    output_channels: Vec<Option<String>>,
    output_index: HashMap<String, usize>,
    markers: EventMarkers,
    offsets: FamilyOffsets,
}

impl ChannelMap {
    /// Derives the channel map. Pure function of the hardware description.
    pub fn new(hardware: HardwareDescription) -> Self {
        let mut builder = Builder::default();

        // Inputs
        let (mut n_serial, mut n_usb, mut n_port, mut n_bnc, mut n_wire) = (0, 0, 0, 0, 0);
        for (channel, code) in hardware.inputs.iter().enumerate() {
            match PortType::from_code(*code) {
                PortType::Uart => {
                    n_serial += 1;
                    builder.input_channel(Some(format!("Serial{}", n_serial)));
                    for k in 1..=hardware.events_per_serial_channel {
                        builder.event(format!("Serial{}_{}", n_serial, k), EventClass::Input, None);
                    }
                }
                PortType::Usb => {
                    n_usb += 1;
                    builder.input_channel(Some(format!("USB{}", n_usb)));
                    builder.offsets.event_usb.get_or_insert(builder.events.len());
                    for k in 1..=hardware.events_per_serial_channel {
                        builder.event(format!("SoftCode{}", k), EventClass::Input, None);
                    }
                }
                port_type @ (PortType::Port | PortType::Bnc | PortType::Wire) => {
                    let (name, offset) = match port_type {
                        PortType::Port => {
                            n_port += 1;
                            (format!("Port{}", n_port), &mut builder.offsets.event_port)
                        }
                        PortType::Bnc => {
                            n_bnc += 1;
                            (format!("BNC{}", n_bnc), &mut builder.offsets.event_bnc)
                        }
                        _ => {
                            n_wire += 1;
                            (format!("Wire{}", n_wire), &mut builder.offsets.event_wire)
                        }
                    };
                    offset.get_or_insert(builder.events.len());
                    builder.event(
                        format!("{}In", name),
                        EventClass::Input,
                        Some(InputLevel { channel, level: 1 }),
                    );
                    builder.event(
                        format!("{}Out", name),
                        EventClass::Input,
                        Some(InputLevel { channel, level: 0 }),
                    );
                    builder.input_channel(Some(name));
                }
                PortType::Valve | PortType::Unknown(_) => builder.input_channel(None),
            }
        }

        // Synthetic event groups
        let global_timer_start = builder.events.len();
        for i in 0..hardware.n_global_timers as usize {
            builder.event(
                format!("GlobalTimer{}_Start", i + 1),
                EventClass::GlobalTimerStart(i),
                None,
            );
        }
        let global_timer_end = builder.events.len();
        for i in 0..hardware.n_global_timers as usize {
            builder.event(
                format!("GlobalTimer{}_End", i + 1),
                EventClass::GlobalTimerEnd(i),
                None,
            );
        }
        let global_counter = builder.events.len();
        for i in 0..hardware.n_global_counters as usize {
            builder.event(
                format!("GlobalCounter{}_End", i + 1),
                EventClass::GlobalCounter(i),
                None,
            );
        }
        let condition = builder.events.len();
        for i in 0..hardware.n_conditions as usize {
            builder.event(format!("Condition{}", i + 1), EventClass::Condition(i), None);
        }
        let jump = builder.events.len();
        for i in 1..=n_serial {
            builder.event(format!("Serial{}Jump", i), EventClass::Jump, None);
        }
        builder.event("SoftJump".to_string(), EventClass::Jump, None);
        let tup = builder.events.len();
        builder.event(TUP.to_string(), EventClass::Tup, None);

        // Outputs
        let (mut n_serial, mut n_bnc, mut n_wire, mut n_pwm) = (0, 0, 0, 0);
        for (channel, code) in hardware.outputs.iter().enumerate() {
            let name = match PortType::from_code(*code) {
                PortType::Uart => {
                    n_serial += 1;
                    Some(format!("Serial{}", n_serial))
                }
                PortType::Usb => {
                    builder.offsets.output_usb.get_or_insert(channel);
                    Some(SOFT_CODE.to_string())
                }
                PortType::Valve => {
                    builder.offsets.output_spi.get_or_insert(channel);
                    Some(VALVE_STATE.to_string())
                }
                PortType::Bnc => {
                    builder.offsets.output_bnc.get_or_insert(channel);
                    n_bnc += 1;
                    Some(format!("BNC{}", n_bnc))
                }
                PortType::Wire => {
                    builder.offsets.output_wire.get_or_insert(channel);
                    n_wire += 1;
                    Some(format!("Wire{}", n_wire))
                }
                PortType::Port => {
                    builder.offsets.output_pwm.get_or_insert(channel);
                    n_pwm += 1;
                    Some(format!("PWM{}", n_pwm))
                }
                // Keeps its slot so later channels stay at their hardware index.
                PortType::Unknown(_) => None,
            };
            builder.outputs.push(name);
        }
        for name in [GLOBAL_TIMER_TRIG, GLOBAL_TIMER_CANCEL, GLOBAL_COUNTER_RESET] {
            builder.outputs.push(Some(name.to_string()));
        }

        let markers = EventMarkers {
            global_timer_start,
            global_timer_end,
            global_counter,
            condition,
            jump,
            tup,
        };
        tracing::debug!(
            "Channel map: {} events, {} inputs, {} outputs, Tup at {}",
            builder.events.len(),
            builder.inputs.len(),
            builder.outputs.len(),
            tup
        );
        builder.finish(hardware, markers)
    }

    pub fn hardware(&self) -> &HardwareDescription {
        &self.hardware
    }

    pub fn event_names(&self) -> &[String] {
        &self.event_names
    }

    pub fn n_events(&self) -> usize {
        self.event_names.len()
    }

    pub fn event_name(&self, code: usize) -> Option<&str> {
        self.event_names.get(code).map(String::as_str)
    }

    /// Looks up an event code by name. First occurrence wins when a name is
    /// repeated (several USB channels share the `SoftCodeN` names).
    pub fn event_code(&self, name: &str) -> Option<usize> {
        self.event_index.get(name).copied()
    }

    pub fn event_class(&self, code: usize) -> Option<EventClass> {
        self.event_classes.get(code).copied()
    }

    /// Channel and level reported by a digital `In`/`Out` event.
    pub fn input_level(&self, code: usize) -> Option<InputLevel> {
        self.event_levels.get(code).copied().flatten()
    }

    /// Event code reporting `channel` going to `level` (0 = `Out`, else `In`).
    pub fn input_event_code(&self, channel: usize, level: u8) -> Option<usize> {
        let want = u8::from(level > 0);
        self.event_levels.iter().position(|l| {
            matches!(l, Some(InputLevel { channel: c, level: lv }) if *c == channel && *lv == want)
        })
    }

    /// Names of the addressable input channels, in hardware order.
    pub fn input_channel_names(&self) -> Vec<&str> {
        self.input_channels.iter().flatten().map(String::as_str).collect()
    }

    /// Hardware index of a named input channel.
    pub fn input_channel(&self, name: &str) -> Option<usize> {
        self.input_channels
            .iter()
            .position(|n| n.as_deref() == Some(name))
    }

    /// Names of the addressable output channels, in code order.
    pub fn output_channel_names(&self) -> Vec<&str> {
        self.output_channels.iter().flatten().map(String::as_str).collect()
    }

    /// Number of output channel codes, unnamed hardware outputs included.
    pub fn n_output_channels(&self) -> usize {
        self.output_channels.len()
    }

    /// Looks up an output channel code by name.
    pub fn output_code(&self, name: &str) -> Option<usize> {
        self.output_index.get(name).copied()
    }

    pub fn output_name(&self, code: usize) -> Option<&str> {
        self.output_channels.get(code).and_then(|n| n.as_deref())
    }

    pub fn markers(&self) -> &EventMarkers {
        &self.markers
    }

    pub fn offsets(&self) -> &FamilyOffsets {
        &self.offsets
    }

    /// Event code of the state-timer timeout.
    pub fn tup(&self) -> usize {
        self.markers.tup
    }
}

#[derive(Default)]
struct Builder {
    events: Vec<String>,
    classes: Vec<EventClass>,
    levels: Vec<Option<InputLevel>>,
    inputs: Vec<Option<String>>,
    outputs: Vec<Option<String>>,
    offsets: FamilyOffsets,
}

impl Builder {
    fn event(&mut self, name: String, class: EventClass, level: Option<InputLevel>) {
        self.events.push(name);
        self.classes.push(class);
        self.levels.push(level);
    }

    fn input_channel(&mut self, name: Option<String>) {
        self.inputs.push(name);
    }

    fn finish(self, hardware: HardwareDescription, markers: EventMarkers) -> ChannelMap {
        let mut event_index = HashMap::with_capacity(self.events.len());
        for (code, name) in self.events.iter().enumerate() {
            event_index.entry(name.clone()).or_insert(code);
        }
        let mut output_index = HashMap::with_capacity(self.outputs.len());
        for (code, name) in self.outputs.iter().enumerate() {
            if let Some(name) = name {
                output_index.entry(name.clone()).or_insert(code);
            }
        }
        ChannelMap {
            hardware,
            event_names: self.events,
            event_classes: self.classes,
            event_levels: self.levels,
            event_index,
            input_channels: self.inputs,
            output_channels: self.outputs,
            output_index,
            markers,
            offsets: self.offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_hardware() -> HardwareDescription {
        HardwareDescription {
            max_states: 128,
            cycle_period: 1000,
            events_per_serial_channel: 2,
            n_global_timers: 2,
            n_global_counters: 1,
            n_conditions: 1,
            inputs: "UXBP".chars().collect(),
            outputs: "UXSBWP".chars().collect(),
            ..HardwareDescription::default()
        }
    }

    #[test]
    fn test_event_layout() {
        let map = ChannelMap::new(small_hardware());
        let names: Vec<&str> = map.event_names().iter().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "Serial1_1",
                "Serial1_2",
                "SoftCode1",
                "SoftCode2",
                "BNC1In",
                "BNC1Out",
                "Port1In",
                "Port1Out",
                "GlobalTimer1_Start",
                "GlobalTimer2_Start",
                "GlobalTimer1_End",
                "GlobalTimer2_End",
                "GlobalCounter1_End",
                "Condition1",
                "Serial1Jump",
                "SoftJump",
                "Tup",
            ]
        );

        let m = map.markers();
        assert_eq!(m.global_timer_start, 8);
        assert_eq!(m.global_timer_end, 10);
        assert_eq!(m.global_counter, 12);
        assert_eq!(m.condition, 13);
        assert_eq!(m.jump, 14);
        assert_eq!(m.tup, 16);
        assert_eq!(map.tup(), map.n_events() - 1);
    }

    #[test]
    fn test_input_and_output_channels() {
        let map = ChannelMap::new(small_hardware());
        assert_eq!(
            map.input_channel_names(),
            vec!["Serial1", "USB1", "BNC1", "Port1"]
        );
        assert_eq!(
            map.output_channel_names(),
            vec![
                "Serial1",
                "SoftCode",
                "ValveState",
                "BNC1",
                "Wire1",
                "PWM1",
                "GlobalTimerTrig",
                "GlobalTimerCancel",
                "GlobalCounterReset"
            ]
        );
        assert_eq!(map.input_channel("Port1"), Some(3));
        assert_eq!(map.output_code("PWM1"), Some(5));
        assert_eq!(map.output_code(GLOBAL_COUNTER_RESET), Some(8));
        assert_eq!(map.output_code("PWM9"), None);
    }

    #[test]
    fn test_unrecognized_channels_stay_unnamed() {
        let hw = HardwareDescription {
            inputs: "PVQP".chars().collect(),
            outputs: "BQP".chars().collect(),
            ..small_hardware()
        };
        let map = ChannelMap::new(hw);
        assert_eq!(map.input_channel_names(), vec!["Port1", "Port2"]);
        assert_eq!(map.input_channel("Port2"), Some(3));
        assert_eq!(map.input_level(map.event_code("Port2In").unwrap()).unwrap().channel, 3);
        assert!(!map.event_names().iter().any(|n| n.starts_with("Input")));

        assert_eq!(map.n_output_channels(), 6);
        assert_eq!(map.output_name(1), None);
        assert_eq!(map.output_code("PWM1"), Some(2));
        assert_eq!(map.output_code(GLOBAL_TIMER_TRIG), Some(3));
        assert!(!map.output_channel_names().iter().any(|n| n.starts_with("Output")));
    }

    #[test]
    fn test_event_classes() {
        let map = ChannelMap::new(small_hardware());
        let code = |name| map.event_code(name).unwrap();
        assert_eq!(map.event_class(code("Port1In")), Some(EventClass::Input));
        assert_eq!(
            map.event_class(code("GlobalTimer2_Start")),
            Some(EventClass::GlobalTimerStart(1))
        );
        assert_eq!(
            map.event_class(code("GlobalTimer1_End")),
            Some(EventClass::GlobalTimerEnd(0))
        );
        assert_eq!(
            map.event_class(code("GlobalCounter1_End")),
            Some(EventClass::GlobalCounter(0))
        );
        assert_eq!(
            map.event_class(code("Condition1")),
            Some(EventClass::Condition(0))
        );
        assert_eq!(map.event_class(code("SoftJump")), Some(EventClass::Jump));
        assert_eq!(map.event_class(code("Tup")), Some(EventClass::Tup));
        assert_eq!(map.event_class(999), None);
    }

    #[test]
    fn test_input_levels() {
        let map = ChannelMap::new(small_hardware());
        let port_in = map.event_code("Port1In").unwrap();
        let port_out = map.event_code("Port1Out").unwrap();
        assert_eq!(
            map.input_level(port_in),
            Some(InputLevel {
                channel: 3,
                level: 1
            })
        );
        assert_eq!(
            map.input_level(port_out),
            Some(InputLevel {
                channel: 3,
                level: 0
            })
        );
        assert_eq!(map.input_level(map.tup()), None);
        assert_eq!(map.input_event_code(3, 1), Some(port_in));
        assert_eq!(map.input_event_code(3, 0), Some(port_out));
        assert_eq!(map.input_event_code(0, 1), None);
    }

    #[test]
    fn test_family_offsets() {
        let map = ChannelMap::new(small_hardware());
        let offsets = map.offsets();
        assert_eq!(offsets.event_usb, Some(2));
        assert_eq!(offsets.event_bnc, Some(4));
        assert_eq!(offsets.event_port, Some(6));
        assert_eq!(offsets.event_wire, None);
        assert_eq!(offsets.output_usb, Some(1));
        assert_eq!(offsets.output_spi, Some(2));
        assert_eq!(offsets.output_pwm, Some(5));
    }

    #[test]
    fn test_default_profile_fits_in_a_byte() {
        let map = ChannelMap::new(HardwareDescription::default());
        assert!(map.n_events() < 255);
        assert_eq!(map.event_name(map.tup()), Some("Tup"));
        assert_eq!(map.event_code("Port8Out"), Some(map.markers().global_timer_start - 1));
    }

    fn arb_hardware() -> impl Strategy<Value = HardwareDescription> {
        (
            "[UXPBWS]{0,12}",
            "[UXPBWS]{0,12}",
            0u8..8,
            1u8..8,
            1u8..8,
            1u8..8,
        )
            .prop_map(|(inputs, outputs, per_serial, timers, counters, conditions)| {
                HardwareDescription {
                    events_per_serial_channel: per_serial,
                    n_global_timers: timers,
                    n_global_counters: counters,
                    n_conditions: conditions,
                    inputs: inputs.chars().collect(),
                    outputs: outputs.chars().collect(),
                    ..HardwareDescription::default()
                }
            })
    }

    proptest! {
        #[test]
        fn prop_channel_map_is_deterministic(hw in arb_hardware()) {
            let a = ChannelMap::new(hw.clone());
            let b = ChannelMap::new(hw);
            prop_assert_eq!(a.event_names(), b.event_names());
            prop_assert_eq!(a.output_channel_names(), b.output_channel_names());
            prop_assert_eq!(a.markers(), b.markers());
        }

        #[test]
        fn prop_markers_strictly_increase_and_tup_is_last(hw in arb_hardware()) {
            let map = ChannelMap::new(hw);
            let m = *map.markers();
            prop_assert!(m.global_timer_start < m.global_timer_end);
            prop_assert!(m.global_timer_end < m.global_counter);
            prop_assert!(m.global_counter < m.condition);
            prop_assert!(m.condition < m.jump);
            prop_assert!(m.jump < m.tup);
            prop_assert_eq!(m.tup, map.n_events() - 1);
            prop_assert_eq!(map.event_names().iter().filter(|n| *n == TUP).count(), 1);
        }

        #[test]
        fn prop_channels_parallel_hardware(hw in arb_hardware()) {
            let map = ChannelMap::new(hw.clone());
            prop_assert!(map.input_channel_names().len() <= hw.inputs.len());
            prop_assert_eq!(map.n_output_channels(), hw.outputs.len() + 3);
        }
    }
}
