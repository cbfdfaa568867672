//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults (every field has one, so no file is required)
//! 2. A TOML file (`config/daqlink.toml` by default)
//! 3. Environment variables prefixed with `DAQLINK_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use daqlink::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Streaming at {} Hz", config.streaming.frequency_hz);
//! # Ok::<(), daqlink::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Live streaming and device state machine settings
    pub streaming: StreamingConfig,
    /// Transport (USB-serial / TCP) settings
    pub transport: TransportConfig,
    /// SD-card log import settings
    pub import: ImportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daqlink".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Sample rate requested from the device when streaming or logging to SD
    pub frequency_hz: u32,
    /// Delay after attaching a consumer or switching interfaces before the
    /// next command is issued. The device does not acknowledge these transitions.
    pub settle_delay_ms: u64,
    /// Interval between device-info requests while waiting for a status reply
    pub status_retry_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 100,
            settle_delay_ms: 100,
            status_retry_ms: 1000,
        }
    }
}

impl StreamingConfig {
    /// Settle delay as a `Duration`
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Status retry period as a `Duration`
    pub fn status_retry(&self) -> Duration {
        Duration::from_millis(self.status_retry_ms)
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// USB-serial baud rate
    pub baud_rate: u32,
    /// TCP port of the device's network interface
    pub tcp_port: u16,
    /// Timeout for opening a connection
    pub connect_timeout_ms: u64,
    /// Silence that terminates a text or raw response
    pub text_idle_ms: u64,
    /// Capacity of the queue between the transport reader and the state machine
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            tcp_port: 9760,
            connect_timeout_ms: 5000,
            text_idle_ms: 250,
            channel_capacity: 1024,
        }
    }
}

impl TransportConfig {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Text idle gap as a `Duration`
    pub fn text_idle(&self) -> Duration {
        Duration::from_millis(self.text_idle_ms)
    }
}

/// SD-card import configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Samples per bulk insert
    pub batch_size: usize,
    /// Smallest frame the log parser will try to decode
    pub min_message_len: usize,
    /// Largest frame the log parser will try to decode
    pub max_message_len: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            min_message_len: 10,
            max_message_len: 1024,
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/daqlink.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `DAQLINK_`.
    /// Example: `DAQLINK_STREAMING__FREQUENCY_HZ=1000`
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/daqlink.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQLINK_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.streaming.frequency_hz == 0 {
            return Err(DaqError::Configuration(
                "streaming.frequency_hz must be greater than 0".to_string(),
            ));
        }

        if self.import.batch_size == 0 {
            return Err(DaqError::Configuration(
                "import.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.import.min_message_len == 0
            || self.import.min_message_len > self.import.max_message_len
        {
            return Err(DaqError::Configuration(format!(
                "Invalid message length window {}..={}",
                self.import.min_message_len, self.import.max_message_len
            )));
        }

        if self.transport.channel_capacity == 0 {
            return Err(DaqError::Configuration(
                "transport.channel_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.import.batch_size, 1000);
        assert_eq!(config.import.min_message_len, 10);
        assert_eq!(config.import.max_message_len, 1024);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.streaming.frequency_hz, 100);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[streaming]\nfrequency_hz = 500\n\n[import]\nbatch_size = 250\n"
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.streaming.frequency_hz, 500);
        assert_eq!(config.import.batch_size, 250);
        // Untouched sections keep their defaults
        assert_eq!(config.transport.tcp_port, 9760);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = AppConfig::default();
        config.import.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_inverted_length_window() {
        let mut config = AppConfig::default();
        config.import.min_message_len = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
