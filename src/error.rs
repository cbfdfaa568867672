//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different kinds of errors that can occur while talking to a device.
//!
//! ## Error Hierarchy
//!
//! - **`Config` / `Configuration`**: loading failures from `figment`, and semantic
//!   validation failures of an otherwise well-formed configuration.
//! - **`Io`**: transport I/O failures. Undecodable frames are dropped by the codec
//!   and never surface as errors.
//! - **Interface constraints** (`UsbRequired`, `InvalidMode`, `Busy`): operations the
//!   device cannot perform in its current mode or over its current connection kind.
//!   These are always returned to the caller, never swallowed.
//! - **`ChannelIndexOutOfRange`**: an analog channel that cannot be represented in
//!   the 32-bit activation mask.
//! - **`FeatureNotEnabled`**: a code path compiled out via Cargo features.
//!
//! Protocol and cardinality errors inside the streaming path are logged and never
//! reach this type; the stream keeps going.

use crate::device::DeviceMode;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors returned by daqlink operations.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Timed out after {0} ms: {1}")]
    Timeout(u64, String),

    #[error("{operation} requires a USB connection")]
    UsbRequired { operation: &'static str },

    #[error("{operation} is not allowed in {mode:?} mode")]
    InvalidMode {
        operation: &'static str,
        mode: DeviceMode,
    },

    #[error("Device is busy: {0}")]
    Busy(String),

    #[error("Device has not reported its status yet")]
    NotReady,

    #[error("Channel index {0} cannot be represented in a 32-bit channel mask")]
    ChannelIndexOutOfRange(u32),

    #[error("Cannot scale {channel}: {reason}")]
    Scaling { channel: String, reason: String },

    #[error("Sample sink error: {0}")]
    Sink(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<tokio::task::JoinError> for DaqError {
    fn from(value: tokio::task::JoinError) -> Self {
        DaqError::Task(value.to_string())
    }
}

impl DaqError {
    /// Whether the error describes an operation the device refused because of
    /// its mode or connection kind, as opposed to a communication failure.
    pub fn is_interface_constraint(&self) -> bool {
        matches!(
            self,
            DaqError::UsbRequired { .. } | DaqError::InvalidMode { .. } | DaqError::Busy(_)
        )
    }
}
