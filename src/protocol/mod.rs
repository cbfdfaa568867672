//! Device wire protocol.
//!
//! Devices speak protobuf in one direction and SCPI-style text in the other:
//!
//! - Host → device: ASCII commands terminated by CRLF ([`crate::device::DeviceCommand`])
//! - Device → host: [`DeviceMessage`] frames, each prefixed by its length as a
//!   protobuf varint. The same framing is used in SD-card log files.
//!
//! Some replies (the SD-card file list, file downloads) are not protobuf; they
//! are delivered by the text and raw consumers in [`consumer`].

pub mod consumer;
pub mod framing;

pub use consumer::{spawn_consumer, BoxReader, BoxWriter, CommandProducer, ConsumerHandle, ConsumerKind, DeviceTransport, Inbound};
pub use framing::{decode_exact_frame, encode_frame, Decoded, DeviceMessageCodec};

/// Status and streaming message sent by the device.
///
/// A status reply carries port counts, calibration tables and identity strings.
/// A streaming message carries a tick timestamp plus raw analog counts and the
/// digital bit field. Both share this one message type.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceMessage {
    /// Hardware tick counter (20 ns per tick, wraps at 32 bits)
    #[prost(uint32, tag = "1")]
    pub msg_time_stamp: u32,
    /// Raw analog readings, one per active analog channel in ascending index order
    #[prost(sint32, repeated, tag = "2")]
    pub analog_in_data: Vec<i32>,
    /// Digital bit field; byte 0 holds lines 0-7, byte 1 holds lines 8-15
    #[prost(bytes = "vec", tag = "3")]
    pub digital_data: Vec<u8>,
    /// Device status code
    #[prost(uint32, tag = "4")]
    pub device_status: u32,
    /// Battery status code
    #[prost(uint32, tag = "5")]
    pub bat_status: u32,
    /// Temperature status code
    #[prost(int32, tag = "6")]
    pub temp_status: i32,
    /// Tick frequency reported by the firmware
    #[prost(uint32, tag = "7")]
    pub timestamp_freq: u32,
    /// Number of analog input ports
    #[prost(uint32, tag = "8")]
    pub analog_in_port_num: u32,
    /// Number of digital I/O ports
    #[prost(uint32, tag = "9")]
    pub digital_port_num: u32,
    /// Number of analog output ports
    #[prost(uint32, tag = "10")]
    pub analog_out_port_num: u32,
    /// ADC resolution (full-scale count)
    #[prost(uint32, tag = "11")]
    pub analog_in_res: u32,
    /// Per-port input range
    #[prost(float, repeated, tag = "12")]
    pub analog_in_port_range: Vec<f32>,
    /// Per-port calibration gain
    #[prost(float, repeated, tag = "13")]
    pub analog_in_cal_m: Vec<f32>,
    /// Per-port calibration offset
    #[prost(float, repeated, tag = "14")]
    pub analog_in_cal_b: Vec<f32>,
    /// Per-port internal scale factor
    #[prost(float, repeated, tag = "15")]
    pub analog_in_int_scale_m: Vec<f32>,
    /// Serial number
    #[prost(uint64, tag = "16")]
    pub device_sn: u64,
    /// Part number
    #[prost(string, tag = "17")]
    pub device_pn: String,
    /// Firmware revision
    #[prost(string, tag = "18")]
    pub device_fw_rev: String,
    /// Hardware revision
    #[prost(string, tag = "19")]
    pub device_hw_rev: String,
}

impl DeviceMessage {
    /// A status reply is usable once the device reports at least one port.
    pub fn is_valid_status(&self) -> bool {
        self.digital_port_num != 0 || self.analog_in_port_num != 0 || self.analog_out_port_num != 0
    }

    /// Serial number as the hex string devices print on their labels, or empty
    /// when the device did not report one.
    pub fn serial_number(&self) -> String {
        if self.device_sn == 0 {
            String::new()
        } else {
            format!("{:X}", self.device_sn)
        }
    }

    /// Whether the message carries a usable tick timestamp.
    pub fn has_timestamp(&self) -> bool {
        self.msg_time_stamp != 0
    }
}
