//! Session configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via BPOD_CONFIG or --config)
//! 3. Environment variables

use bpod_core::hardware::PortType;
use bpod_core::HardwareDescription;
use bpod_protocol::DEFAULT_BAUD_RATE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Session configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial link configuration.
    pub serial: SerialConfig,
    /// Handshake and port setup.
    pub session: SessionConfig,
    /// Software emulator.
    pub emulator: EmulatorConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("BPOD_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.serial.apply_env_overrides();
        self.session.apply_env_overrides();
        self.emulator.apply_env_overrides();
    }

    /// Checks settings that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.serial.validate()?;
        self.emulator.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Serial link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name, e.g. `/dev/ttyACM0` or `COM3`.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Timeout of a single blocking read in milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("BPOD_SERIAL_PORT") {
            if !port.is_empty() {
                self.port = Some(port);
            }
        }

        if let Ok(rate) = std::env::var("BPOD_BAUDRATE") {
            if let Ok(n) = rate.parse() {
                self.baud_rate = n;
            }
        }
    }

    /// Returns the read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial baud_rate must be positive".to_string(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "serial read_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handshake and port setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Firmware version this driver speaks.
    pub target_firmware: u16,
    /// Output channel mirrored on the sync line, 255 for none.
    pub sync_channel: u8,
    /// 0 = toggle on each state change, 1 = high while the channel is high.
    pub sync_mode: u8,
    /// Enable flags for behavior ports, in port order. Ports past the end
    /// of the list are disabled. `None` keeps the device default.
    pub ports_enabled: Option<Vec<bool>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_firmware: 22,
            sync_channel: 255,
            sync_mode: 1,
            ports_enabled: None,
        }
    }
}

impl SessionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(version) = std::env::var("BPOD_TARGET_FIRMWARE") {
            if let Ok(n) = version.parse() {
                self.target_firmware = n;
            }
        }

        if let Ok(channel) = std::env::var("BPOD_SYNC_CHANNEL") {
            if let Ok(n) = channel.parse() {
                self.sync_channel = n;
            }
        }

        if let Ok(mode) = std::env::var("BPOD_SYNC_MODE") {
            if let Ok(n) = mode.parse() {
                self.sync_mode = n;
            }
        }
    }

    /// Input enable mask sent to the device.
    pub fn inputs_enabled(&self, hw: &HardwareDescription) -> Vec<bool> {
        let mut enabled = hw.inputs_enabled();
        let Some(ports) = &self.ports_enabled else {
            return enabled;
        };
        let behavior_ports = hw
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, code)| PortType::from_code(**code) == PortType::Port)
            .map(|(i, _)| i);
        for (n, channel) in behavior_ports.enumerate() {
            enabled[channel] = ports.get(n).copied().unwrap_or(false);
        }
        enabled
    }
}

/// Software emulator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Run sessions against the emulator instead of a serial device.
    pub enabled: bool,
    /// Hardware profile the emulator reports.
    pub hardware: HardwareDescription,
}

impl EmulatorConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("BPOD_EMULATOR") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hardware.cycle_period == 0 {
            return Err(ConfigError::ValidationError(
                "emulator hardware cycle_period must be positive".to_string(),
            ));
        }
        if self.hardware.max_states == 0 {
            return Err(ConfigError::ValidationError(
                "emulator hardware max_states must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.serial.baud_rate, 1_312_500);
        assert_eq!(config.serial.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.session.target_firmware, 22);
        assert_eq!(config.session.sync_channel, 255);
        assert_eq!(config.session.sync_mode, 1);
        assert!(!config.emulator.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.serial.port = Some("/dev/ttyACM0".to_string());
        config.emulator.hardware.inputs = "BBPP".chars().collect();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bpod.yaml");
        std::fs::write(
            &path,
            "session:\n  target_firmware: 23\nemulator:\n  enabled: true\n  hardware:\n    inputs: PPB\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.session.target_firmware, 23);
        assert_eq!(config.session.sync_channel, 255);
        assert!(config.emulator.enabled);
        assert_eq!(config.emulator.hardware.inputs, vec!['P', 'P', 'B']);
        assert_eq!(config.emulator.hardware.cycle_period, 100);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let mut config = Config::default();
        config.session.ports_enabled = Some(vec![true, false]);
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::IoError(p, _)) if p == missing
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "serial: [not, a, map]\n").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.serial.baud_rate = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = Config::default();
        config.emulator.hardware.cycle_period = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ports_enabled_override() {
        let hw = HardwareDescription {
            inputs: "UBPPPPW".chars().collect(),
            ..HardwareDescription::default()
        };
        let mut session = SessionConfig::default();
        assert_eq!(session.inputs_enabled(&hw), hw.inputs_enabled());

        session.ports_enabled = Some(vec![false, true]);
        assert_eq!(
            session.inputs_enabled(&hw),
            vec![false, true, false, true, false, false, true]
        );
    }
}
