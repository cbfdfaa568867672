//! Channel descriptors and analog scaling.

use crate::error::{AppResult, DaqError};
use crate::stream::DataSample;
use serde::{Deserialize, Serialize};

/// Analog or digital channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Analog input, sent as a raw ADC count
    Analog,
    /// Digital I/O line, sent as one bit of the digital bit field
    Digital,
}

/// Data direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelDirection {
    /// Device reads the line
    #[default]
    Input,
    /// Device drives the line
    Output,
}

/// Per-channel analog calibration.
///
/// `value = (raw / resolution) * port_range * calibration_m * internal_scale_m + calibration_b`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalogCalibration {
    /// Full-scale ADC count
    pub resolution: f64,
    /// Input range of the port
    pub port_range: f64,
    /// Calibration gain
    pub calibration_m: f64,
    /// Calibration offset
    pub calibration_b: f64,
    /// Internal scale factor
    pub internal_scale_m: f64,
}

impl Default for AnalogCalibration {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            port_range: 1.0,
            calibration_m: 1.0,
            calibration_b: 0.0,
            internal_scale_m: 1.0,
        }
    }
}

impl AnalogCalibration {
    /// Convert a raw reading to engineering units.
    pub fn scale(&self, raw: i32) -> Option<f64> {
        if self.resolution == 0.0 {
            return None;
        }
        let value = (f64::from(raw) / self.resolution)
            * self.port_range
            * self.calibration_m
            * self.internal_scale_m
            + self.calibration_b;
        value.is_finite().then_some(value)
    }
}

/// One channel of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Index, unique per kind within a device
    pub index: u32,
    /// Analog or digital
    pub kind: ChannelKind,
    /// Input or output
    pub direction: ChannelDirection,
    /// Whether the device is currently sampling this channel
    pub is_active: bool,
    /// Scaling parameters; present for analog channels only
    pub calibration: Option<AnalogCalibration>,
    /// Most recent sample assigned to this channel
    #[serde(skip)]
    pub latest: Option<DataSample>,
}

impl ChannelDescriptor {
    /// Inactive analog input channel.
    pub fn analog(index: u32, calibration: AnalogCalibration) -> Self {
        Self {
            index,
            kind: ChannelKind::Analog,
            direction: ChannelDirection::Input,
            is_active: false,
            calibration: Some(calibration),
            latest: None,
        }
    }

    /// Inactive digital channel.
    pub fn digital(index: u32, direction: ChannelDirection) -> Self {
        Self {
            index,
            kind: ChannelKind::Digital,
            direction,
            is_active: false,
            calibration: None,
            latest: None,
        }
    }

    /// Builder-style activation, handy when describing a logged configuration.
    pub fn active(mut self) -> Self {
        self.is_active = true;
        self
    }

    /// Display name (`AI3`, `DIO12`).
    pub fn name(&self) -> String {
        channel_name(self.kind, self.index)
    }

    /// Scale a raw analog reading for this channel.
    pub fn scale(&self, raw: i32) -> AppResult<f64> {
        let calibration = self.calibration.as_ref().ok_or_else(|| DaqError::Scaling {
            channel: self.name(),
            reason: "channel has no analog calibration".to_string(),
        })?;
        calibration.scale(raw).ok_or_else(|| DaqError::Scaling {
            channel: self.name(),
            reason: format!(
                "raw value {raw} does not scale to a finite number (resolution {})",
                calibration.resolution
            ),
        })
    }
}

/// Display name for a channel of the given kind and index.
pub fn channel_name(kind: ChannelKind, index: u32) -> String {
    match kind {
        ChannelKind::Analog => format!("AI{index}"),
        ChannelKind::Digital => format!("DIO{index}"),
    }
}
