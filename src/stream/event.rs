//! Samples and events produced by a device.

use crate::device::DeviceIdentity;
use crate::protocol::DeviceMessage;
use crate::sdcard::SdCardFileMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One scaled reading of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSample {
    /// Serial number of the device that produced the reading
    pub serial: String,
    /// Channel name (`AI0`, `DIO3`)
    pub channel: String,
    /// Reconstructed host time
    pub timestamp: DateTime<Utc>,
    /// Scaled value; digital channels are 0.0 or 1.0
    pub value: f64,
}

/// Per-message summary forwarded alongside the samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessageSummary {
    /// Serial number of the device
    pub serial: String,
    /// Reconstructed host time of the message
    pub timestamp: DateTime<Utc>,
    /// Raw analog values carried by the message
    pub analog_count: usize,
    /// Digital bytes carried by the message
    pub digital_count: usize,
    /// Device status code
    pub device_status: u32,
    /// Battery status code
    pub bat_status: u32,
    /// Temperature status code
    pub temp_status: i32,
    /// Whether the tick counter wrapped since the previous message
    pub rollover: bool,
}

impl DeviceMessageSummary {
    /// Summarize `message`.
    pub fn from_message(
        serial: &str,
        message: &DeviceMessage,
        timestamp: DateTime<Utc>,
        rollover: bool,
    ) -> Self {
        Self {
            serial: serial.to_string(),
            timestamp,
            analog_count: message.analog_in_data.len(),
            digital_count: message.digital_data.len(),
            device_status: message.device_status,
            bat_status: message.bat_status,
            temp_status: message.temp_status,
            rollover,
        }
    }
}

/// Events broadcast by a live device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A new sample for one channel
    Sample(DataSample),
    /// Summary of a processed streaming message
    Message(DeviceMessageSummary),
    /// The device answered a status request and its channels were hydrated
    StatusUpdated(DeviceIdentity),
    /// The SD-card file list was refreshed
    SdCardFiles(Vec<SdCardFileMeta>),
}
