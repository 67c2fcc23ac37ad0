//! Engine configuration using Figment
//!
//! Configuration is loaded from (in order of precedence, highest first):
//! 1. Environment variables prefixed with `CALSEQ_`
//! 2. A TOML configuration file (default: `config/calseq.toml`)
//!
//! Nested keys are separated by a double underscore in environment variables:
//!
//! ```text
//! CALSEQ_APPLICATION__LOG_LEVEL=debug
//! CALSEQ_EXECUTION__DEFAULT_READ_ATTEMPTS=3
//! ```
//!
//! # Example
//!
//! ```no_run
//! use calseq::config::EngineConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::load_from("config/calseq.toml")?;
//!     println!("Interfaces: {}", config.interfaces.len());
//!     Ok(())
//! }
//! ```

use crate::transport::{InterfaceConfig, InterfaceKind, TimeoutOptions};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Highest primary address on an IEEE-488 bus.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The figment providers could not be merged or extracted.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A loaded value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sequence execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Communication interfaces available to action runs
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    /// Devices (units) reachable through the interfaces
    #[serde(default)]
    pub devices: Vec<DeviceBinding>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Sequence execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Read attempts for instructions that do not declare their own
    #[serde(default = "default_read_attempts")]
    pub default_read_attempts: u32,
    /// Pause between failed read attempts
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Budget for opening a link.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Budget for one read.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Budget for one write.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Capacity of result and event channels
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_read_attempts: default_read_attempts(),
            retry_backoff: default_retry_backoff(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ExecutionConfig {
    /// Per-operation timeouts applied to interfaces that do not set their own.
    pub fn timeouts(&self) -> TimeoutOptions {
        TimeoutOptions {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

/// Maps a procedure unit id to the interface (and bus address) it is wired to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceBinding {
    /// Unit id referenced by sequence operations
    pub unit_id: String,
    /// Name of the communication interface the device hangs off
    pub interface: String,
    /// Primary GPIB address, when the interface is a GPIB controller
    #[serde(default)]
    pub gpib_address: Option<u8>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "calseq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_read_attempts() -> u32 {
    1
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_event_capacity() -> usize {
    256
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl EngineConfig {
    /// Load configuration from `config/calseq.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/calseq.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Values missing from the file fall back to their defaults; after loading
    /// the configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CALSEQ_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::string(source))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level and format are known
    /// - At least one read attempt is configured
    /// - Interface names and device unit ids are unique
    /// - Every device references a defined interface
    /// - Each interface carries the settings block its type needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.execution.default_read_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "default_read_attempts must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for interface in &self.interfaces {
            if !names.insert(interface.name.to_uppercase()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate interface name: '{}'",
                    interface.name
                )));
            }
            Self::validate_interface(interface)?;
        }

        let mut units = HashSet::new();
        for device in &self.devices {
            if !units.insert(device.unit_id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device unit id: '{}'",
                    device.unit_id
                )));
            }
            if !names.contains(&device.interface.to_uppercase()) {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}' references unknown interface '{}'",
                    device.unit_id, device.interface
                )));
            }
            if let Some(address) = device.gpib_address {
                if address > MAX_GPIB_ADDRESS {
                    return Err(ConfigError::ValidationError(format!(
                        "Device '{}': GPIB address {} is outside 0-{}",
                        device.unit_id, address, MAX_GPIB_ADDRESS
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate a specific interface's configuration
    fn validate_interface(interface: &InterfaceConfig) -> Result<(), ConfigError> {
        let missing = |block: &str| {
            ConfigError::ValidationError(format!(
                "{} interface '{}' missing '{}' configuration block",
                interface.kind, interface.name, block
            ))
        };

        match interface.kind {
            InterfaceKind::NationalInstrumentsGpib => {
                if interface.national_instruments_gpib.is_none() {
                    return Err(missing("nationalInstrumentsGpib"));
                }
            }
            InterfaceKind::PrologixGpibTcp => {
                let tcp = interface.tcp.as_ref().ok_or_else(|| missing("tcp"))?;
                if tcp.host.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Interface '{}': 'host' cannot be empty",
                        interface.name
                    )));
                }
            }
            InterfaceKind::PrologixGpibUsb | InterfaceKind::SerialPort => {
                let serial = interface.serial.as_ref().ok_or_else(|| missing("serial"))?;
                if serial.port.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Interface '{}': 'port' cannot be empty",
                        interface.name
                    )));
                }
            }
            InterfaceKind::Emulated => {}
        }

        if let Some(gpib) = &interface.gpib {
            if gpib.address > MAX_GPIB_ADDRESS {
                return Err(ConfigError::ValidationError(format!(
                    "Interface '{}': controller address {} is outside 0-{}",
                    interface.name, gpib.address, MAX_GPIB_ADDRESS
                )));
            }
        }

        Ok(())
    }

    /// Look up the device bound to a unit id
    pub fn device(&self, unit_id: &str) -> Option<&DeviceBinding> {
        self.devices.iter().find(|d| d.unit_id == unit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [application]
        name = "bench-3"
        log_level = "debug"

        [execution]
        default_read_attempts = 3
        retry_backoff = "250ms"

        [[interfaces]]
        name = "gpib0"
        type = "Prologix GPIB TCP"
        tcp = { host = "10.0.0.5", port = 1234 }

        [[interfaces]]
        name = "offline"
        type = "Emulated"

        [[devices]]
        unit_id = "DMM1"
        interface = "gpib0"
        gpib_address = 22
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "bench-3");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.execution.default_read_attempts, 3);
        assert_eq!(config.execution.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.execution.read_timeout, Duration::from_secs(2));
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.device("DMM1").unwrap().gpib_address, Some(22));
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.execution.default_read_attempts, 1);
        assert!(config.interfaces.is_empty());
    }

    #[test]
    fn test_rejects_unknown_interface_reference() {
        let source = r#"
            [[devices]]
            unit_id = "PSU"
            interface = "missing"
        "#;
        let err = EngineConfig::from_toml_str(source).unwrap_err();
        assert!(err.to_string().contains("unknown interface 'missing'"));
    }

    #[test]
    fn test_rejects_prologix_without_tcp_block() {
        let source = r#"
            [[interfaces]]
            name = "gpib0"
            type = "Prologix GPIB TCP"
        "#;
        let err = EngineConfig::from_toml_str(source).unwrap_err();
        assert!(err.to_string().contains("missing 'tcp'"));
    }

    #[test]
    fn test_rejects_duplicate_interfaces() {
        let source = r#"
            [[interfaces]]
            name = "emu"
            type = "Emulated"

            [[interfaces]]
            name = "EMU"
            type = "Emulated"
        "#;
        let err = EngineConfig::from_toml_str(source).unwrap_err();
        assert!(err.to_string().contains("Duplicate interface name"));
    }

    #[test]
    fn test_rejects_out_of_range_gpib_address() {
        let source = r#"
            [[interfaces]]
            name = "emu"
            type = "Emulated"

            [[devices]]
            unit_id = "DMM1"
            interface = "emu"
            gpib_address = 31
        "#;
        assert!(EngineConfig::from_toml_str(source).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.interfaces[0].name, "gpib0");
    }
}
