//! Hardware description reported by the device.

use serde::{Deserialize, Serialize};

/// Kind of a physical input or output channel, from its one-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortType {
    /// 'U': serial module.
    Uart,
    /// 'X': USB soft-code channel.
    Usb,
    /// 'P': behavior port (poke, LED, valve).
    Port,
    /// 'B': BNC.
    Bnc,
    /// 'W': wire terminal.
    Wire,
    /// 'S': SPI valve bank.
    Valve,
    Unknown(char),
}

impl PortType {
    pub fn from_code(code: char) -> Self {
        match code {
            'U' => PortType::Uart,
            'X' => PortType::Usb,
            'P' => PortType::Port,
            'B' => PortType::Bnc,
            'W' => PortType::Wire,
            'S' => PortType::Valve,
            other => PortType::Unknown(other),
        }
    }

    /// Whether the channel produces `In`/`Out` level events.
    pub fn is_digital(&self) -> bool {
        matches!(self, PortType::Port | PortType::Bnc | PortType::Wire)
    }
}

/// Immutable description of the connected device, fetched once per
/// connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareDescription {
    pub firmware_version: u16,
    pub machine_type: u16,
    pub max_states: u16,
    /// Microseconds per device tick.
    pub cycle_period: u16,
    pub events_per_serial_channel: u8,
    pub n_global_timers: u8,
    pub n_global_counters: u8,
    pub n_conditions: u8,
    #[serde(with = "port_codes")]
    pub inputs: Vec<char>,
    #[serde(with = "port_codes")]
    pub outputs: Vec<char>,
}

impl Default for HardwareDescription {
    /// Profile of a state machine r2 board, used by the emulator when no
    /// other profile is configured.
    fn default() -> Self {
        Self {
            firmware_version: 22,
            machine_type: 3,
            max_states: 256,
            cycle_period: 100,
            events_per_serial_channel: 15,
            n_global_timers: 16,
            n_global_counters: 8,
            n_conditions: 16,
            inputs: "UUUXBBWWPPPPPPPP".chars().collect(),
            outputs: "UUUXSBBWWPPPPPPPP".chars().collect(),
        }
    }
}

impl HardwareDescription {
    /// Device ticks per second.
    pub fn cycle_frequency(&self) -> u32 {
        1_000_000u32.checked_div(u32::from(self.cycle_period)).unwrap_or(0)
    }

    /// Converts seconds to the nearest whole number of device ticks.
    pub fn seconds_to_ticks(&self, seconds: f64) -> u32 {
        // `as` saturates: negative and NaN durations become 0.
        (seconds * f64::from(self.cycle_frequency())).round() as u32
    }

    /// Converts device ticks to seconds.
    pub fn ticks_to_seconds(&self, ticks: u32) -> f64 {
        match self.cycle_frequency() {
            0 => 0.0,
            freq => f64::from(ticks) / f64::from(freq),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_type(&self, channel: usize) -> Option<PortType> {
        self.inputs.get(channel).map(|c| PortType::from_code(*c))
    }

    pub fn output_type(&self, channel: usize) -> Option<PortType> {
        self.outputs.get(channel).map(|c| PortType::from_code(*c))
    }

    /// Default input enable mask: every BNC and wire input, and the first
    /// three channels of the first contiguous run of behavior ports.
    pub fn inputs_enabled(&self) -> Vec<bool> {
        let mut enabled = vec![false; self.inputs.len()];
        let mut ports_enabled = 0;
        let mut run_closed = false;
        for (i, code) in self.inputs.iter().enumerate() {
            let port_type = PortType::from_code(*code);
            if port_type == PortType::Port {
                if !run_closed && ports_enabled < 3 {
                    enabled[i] = true;
                    ports_enabled += 1;
                }
                continue;
            }
            if ports_enabled > 0 {
                run_closed = true;
            }
            if matches!(port_type, PortType::Bnc | PortType::Wire) {
                enabled[i] = true;
            }
        }
        enabled
    }
}

/// Serializes a list of port codes as a compact string such as `"UUXBBP"`.
mod port_codes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(codes: &[char], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&codes.iter().collect::<String>())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<char>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.chars().collect())
    }
}
