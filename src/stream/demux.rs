//! Sample demultiplexing and scaling.
//!
//! A streaming message carries the raw values of the *active* channels only,
//! without naming them. Assignment is positional:
//!
//! - Digital: active input lines in index order, each reading one bit of the
//!   digital bit field (byte 0 for lines 0-7, byte 1 for lines 8-15).
//! - Analog: active analog channels in ascending index order; the n-th channel
//!   takes the n-th raw value.
//!
//! Errors are logged and never abort the message. A short analog payload stops
//! assignment at the first channel without a value; channels already assigned
//! keep their new sample.

use crate::device::{ChannelDescriptor, ChannelDirection, ChannelKind};
use crate::protocol::DeviceMessage;
use crate::stream::{DataSample, DeviceMessageSummary};
use chrono::{DateTime, Utc};
use tracing::{error, warn};

/// Digital bit for line `index` from the digital bit field.
pub fn digital_bit(digital_data: &[u8], index: u32) -> Option<bool> {
    let (byte, shift) = if index < 8 {
        (digital_data.first()?, index)
    } else {
        (digital_data.get(1)?, index % 8)
    };
    Some((byte >> shift) & 1 == 1)
}

fn sorted_active(channels: &[ChannelDescriptor], kind: ChannelKind) -> Vec<usize> {
    let mut positions: Vec<usize> = channels
        .iter()
        .enumerate()
        .filter(|(_, ch)| ch.kind == kind && ch.is_active)
        .map(|(pos, _)| pos)
        .collect();
    positions.sort_by_key(|&pos| channels[pos].index);
    positions
}

/// Assign the readings of `message` to `channels`.
///
/// Each sample is written into its channel's `latest` slot and returned.
pub fn demultiplex(
    serial: &str,
    channels: &mut [ChannelDescriptor],
    message: &DeviceMessage,
    timestamp: DateTime<Utc>,
) -> Vec<DataSample> {
    let mut samples = Vec::new();

    if !message.digital_data.is_empty() {
        for pos in sorted_active(channels, ChannelKind::Digital) {
            let channel = &mut channels[pos];
            if channel.direction != ChannelDirection::Input {
                continue;
            }
            let Some(bit) = digital_bit(&message.digital_data, channel.index) else {
                warn!(
                    serial,
                    channel = %channel.name(),
                    bytes = message.digital_data.len(),
                    "Digital data too short for channel"
                );
                continue;
            };
            let sample = DataSample {
                serial: serial.to_string(),
                channel: channel.name(),
                timestamp,
                value: if bit { 1.0 } else { 0.0 },
            };
            channel.latest = Some(sample.clone());
            samples.push(sample);
        }
    }

    let analog = sorted_active(channels, ChannelKind::Analog);
    for (n, pos) in analog.iter().copied().enumerate() {
        let channel = &mut channels[pos];
        let Some(&raw) = message.analog_in_data.get(n) else {
            error!(
                serial,
                expected = analog.len(),
                received = message.analog_in_data.len(),
                channel = %channel.name(),
                "Fewer analog values than active analog channels"
            );
            break;
        };
        match channel.scale(raw) {
            Ok(value) => {
                let sample = DataSample {
                    serial: serial.to_string(),
                    channel: channel.name(),
                    timestamp,
                    value,
                };
                channel.latest = Some(sample.clone());
                samples.push(sample);
            }
            Err(e) => error!(serial, error = %e, "Failed to scale analog value"),
        }
    }

    samples
}

/// Demultiplex `message` and summarize it.
pub fn process_message(
    serial: &str,
    channels: &mut [ChannelDescriptor],
    message: &DeviceMessage,
    timestamp: DateTime<Utc>,
    rollover: bool,
) -> (Vec<DataSample>, DeviceMessageSummary) {
    let samples = demultiplex(serial, channels, message, timestamp);
    let summary = DeviceMessageSummary::from_message(serial, message, timestamp, rollover);
    (samples, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AnalogCalibration;
    use tracing_test::traced_test;

    fn unit() -> AnalogCalibration {
        AnalogCalibration::default()
    }

    fn gain(m: f64) -> AnalogCalibration {
        AnalogCalibration {
            calibration_m: m,
            ..AnalogCalibration::default()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_730_808_000, 0).unwrap()
    }

    #[test]
    fn analog_values_follow_ascending_index_not_activation_order() {
        // Activated in the order 9, 2, 5
        let mut channels = vec![
            ChannelDescriptor::analog(9, gain(3.0)).active(),
            ChannelDescriptor::analog(0, unit()),
            ChannelDescriptor::analog(2, gain(1.0)).active(),
            ChannelDescriptor::analog(5, gain(2.0)).active(),
        ];
        let message = DeviceMessage {
            msg_time_stamp: 1,
            analog_in_data: vec![10, 20, 30],
            ..Default::default()
        };

        let samples = demultiplex("SN", &mut channels, &message, now());
        let got: Vec<(&str, f64)> = samples.iter().map(|s| (s.channel.as_str(), s.value)).collect();
        assert_eq!(got, vec![("AI2", 10.0), ("AI5", 40.0), ("AI9", 90.0)]);
        assert_eq!(channels[0].latest.as_ref().map(|s| s.value), Some(90.0));
        assert!(channels[1].latest.is_none());
    }

    #[test]
    #[traced_test]
    fn short_analog_payload_keeps_partial_assignment() {
        let mut channels = vec![
            ChannelDescriptor::analog(1, unit()).active(),
            ChannelDescriptor::analog(2, unit()).active(),
            ChannelDescriptor::analog(3, unit()).active(),
        ];
        let message = DeviceMessage {
            msg_time_stamp: 1,
            analog_in_data: vec![7],
            ..Default::default()
        };

        let samples = demultiplex("SN", &mut channels, &message, now());
        assert_eq!(samples.len(), 1);
        assert_eq!(channels[0].latest.as_ref().map(|s| s.value), Some(7.0));
        assert!(channels[1].latest.is_none());
        assert!(channels[2].latest.is_none());
        assert!(logs_contain("Fewer analog values than active analog channels"));
    }

    #[test]
    #[traced_test]
    fn scaling_error_does_not_stop_later_channels() {
        let broken = AnalogCalibration {
            resolution: 0.0,
            ..AnalogCalibration::default()
        };
        let mut channels = vec![
            ChannelDescriptor::analog(0, broken).active(),
            ChannelDescriptor::analog(1, unit()).active(),
        ];
        let message = DeviceMessage {
            msg_time_stamp: 1,
            analog_in_data: vec![5, 6],
            ..Default::default()
        };

        let samples = demultiplex("SN", &mut channels, &message, now());
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].channel, "AI1");
        assert_eq!(samples[0].value, 6.0);
        assert!(logs_contain("Failed to scale analog value"));
    }

    #[test]
    fn digital_bits_come_from_both_bytes_and_skip_outputs() {
        let mut channels = vec![
            ChannelDescriptor::digital(0, ChannelDirection::Input).active(),
            ChannelDescriptor::digital(1, ChannelDirection::Output).active(),
            ChannelDescriptor::digital(2, ChannelDirection::Input).active(),
            ChannelDescriptor::digital(9, ChannelDirection::Input).active(),
            ChannelDescriptor::digital(10, ChannelDirection::Input),
        ];
        let message = DeviceMessage {
            msg_time_stamp: 1,
            digital_data: vec![0b0000_0011, 0b0000_0010],
            ..Default::default()
        };

        let samples = demultiplex("SN", &mut channels, &message, now());
        let got: Vec<(&str, f64)> = samples.iter().map(|s| (s.channel.as_str(), s.value)).collect();
        assert_eq!(got, vec![("DIO0", 1.0), ("DIO2", 0.0), ("DIO9", 1.0)]);
        assert!(channels[1].latest.is_none());
    }

    #[test]
    fn digital_bit_reads_second_byte_for_high_lines() {
        assert_eq!(digital_bit(&[0x00, 0x80], 15), Some(true));
        assert_eq!(digital_bit(&[0x80], 7), Some(true));
        assert_eq!(digital_bit(&[0xff], 8), None);
    }

    #[test]
    fn summary_counts_payload() {
        let message = DeviceMessage {
            msg_time_stamp: 1,
            analog_in_data: vec![1, 2],
            digital_data: vec![0],
            bat_status: 3,
            temp_status: -1,
            ..Default::default()
        };
        let mut channels = Vec::new();
        let (_, summary) = process_message("SN", &mut channels, &message, now(), true);
        assert_eq!(summary.analog_count, 2);
        assert_eq!(summary.digital_count, 1);
        assert_eq!(summary.bat_status, 3);
        assert_eq!(summary.temp_status, -1);
        assert!(summary.rollover);
    }
}
