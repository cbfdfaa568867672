//! Device model and the per-device protocol state machine.
//!
//! A connected DAQ unit is one concrete record ([`DeviceIdentity`] plus its
//! [`ChannelDescriptor`]s) tagged with a [`ConnectionKind`]. Behavior that differs
//! between USB and WiFi units is dispatched on that tag rather than through a
//! type hierarchy.
//!
//! - [`channel`]: channel descriptors and analog scaling
//! - [`mask`]: the 32-bit active analog channel mask
//! - [`command`]: the text command surface understood by the firmware
//! - [`controller`]: the mode / message-handler state machine ([`DaqDevice`])

pub mod channel;
pub mod command;
pub mod controller;
pub mod mask;

pub use channel::{AnalogCalibration, ChannelDescriptor, ChannelDirection, ChannelKind};
pub use command::DeviceCommand;
pub use controller::{DaqDevice, DeviceSettings, Handler};
pub use mask::ChannelMask;

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the host reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// USB-serial (CDC) link
    Usb,
    /// WiFi / TCP link
    Wifi,
}

impl ConnectionKind {
    /// SD storage and the network interface share a bus on the device, so SD
    /// operations are only possible while the host talks over USB.
    pub fn supports_sd_card(self) -> bool {
        matches!(self, ConnectionKind::Usb)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Usb => write!(f, "USB"),
            ConnectionKind::Wifi => write!(f, "WiFi"),
        }
    }
}

/// Where the device sends its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceMode {
    /// Stream samples to the host over the active connection
    #[default]
    StreamToApp,
    /// Record samples to the device's own SD card
    LogToDevice,
}

/// Identity of a physical unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Serial number as reported by the device; may be empty before the first
    /// status reply or for units that do not report one
    pub serial_number: String,
    /// Part number (model)
    pub part_number: String,
    /// Firmware revision
    pub firmware_version: String,
    /// How this unit is connected
    pub connection: ConnectionKind,
}

impl DeviceIdentity {
    /// Identity with only a connection kind; the rest is filled in by the
    /// device's status reply.
    pub fn unidentified(connection: ConnectionKind) -> Self {
        Self {
            serial_number: String::new(),
            part_number: String::new(),
            firmware_version: String::new(),
            connection,
        }
    }

    /// Identity with a known serial number.
    pub fn with_serial(serial_number: impl Into<String>, connection: ConnectionKind) -> Self {
        Self {
            serial_number: serial_number.into(),
            ..Self::unidentified(connection)
        }
    }

    /// Key used for duplicate detection. Empty serial numbers never collide.
    pub fn dedup_key(&self) -> Option<&str> {
        if self.serial_number.is_empty() {
            None
        } else {
            Some(self.serial_number.as_str())
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let serial = if self.serial_number.is_empty() {
            "<no serial>"
        } else {
            self.serial_number.as_str()
        };
        if self.part_number.is_empty() {
            write!(f, "{} ({})", serial, self.connection)
        } else {
            write!(f, "{} {} ({})", self.part_number, serial, self.connection)
        }
    }
}

/// Snapshot of everything needed to interpret samples from a device without a
/// live connection (used by the SD-card importer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Which unit the samples belong to
    pub identity: DeviceIdentity,
    /// Channel configuration, including which channels were active
    pub channels: Vec<ChannelDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_serial_has_no_dedup_key() {
        let id = DeviceIdentity::unidentified(ConnectionKind::Wifi);
        assert_eq!(id.dedup_key(), None);

        let id = DeviceIdentity::with_serial("7E2815916200E898", ConnectionKind::Usb);
        assert_eq!(id.dedup_key(), Some("7E2815916200E898"));
    }

    #[test]
    fn only_usb_supports_sd_card() {
        assert!(ConnectionKind::Usb.supports_sd_card());
        assert!(!ConnectionKind::Wifi.supports_sd_card());
    }

    #[test]
    fn display_includes_part_number_when_known() {
        let mut id = DeviceIdentity::with_serial("123", ConnectionKind::Usb);
        assert_eq!(id.to_string(), "123 (USB)");
        id.part_number = "Nq1".to_string();
        assert_eq!(id.to_string(), "Nq1 123 (USB)");
    }
}
