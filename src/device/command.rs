//! Text commands understood by the device firmware.
//!
//! Protocol overview:
//! - Format: SCPI-style ASCII
//! - Terminator: CRLF (`\r\n`)
//! - Commands are fire-and-forget; replies (if any) arrive on the consumer side

use super::channel::ChannelDirection;
use super::mask::ChannelMask;
use std::fmt;

/// A command sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Ask for the protobuf status / info message
    RequestDeviceInfo,
    /// Start streaming at the given rate in Hz
    StartStreaming(u32),
    /// Stop streaming
    StopStreaming,
    /// Set the active analog channel mask
    SetAnalogChannelMask(ChannelMask),
    /// Enable or disable all digital ports
    EnableDigitalPorts(bool),
    /// Set the direction of one digital line
    SetDigitalDirection(u32, ChannelDirection),
    /// Enable or disable the network interface
    EnableNetwork(bool),
    /// Enable or disable SD storage
    EnableSdCard(bool),
    /// Name of the file the device logs into
    SetSdLogFileName(String),
    /// List the files on the SD card
    ListSdFiles,
    /// Send a file from the SD card
    GetSdFile(String),
    /// Delete a file from the SD card
    DeleteSdFile(String),
    /// Select protobuf as the stream format
    SetProtobufStreamFormat,
    /// Disable command echo
    DisableEcho,
    /// Power the measurement front end on
    PowerOn,
    /// Reboot the device
    Reboot,
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::RequestDeviceInfo => write!(f, "SYSTem:SYSInfoPB?"),
            DeviceCommand::StartStreaming(hz) => write!(f, "SYSTem:StartStreamData {hz}"),
            DeviceCommand::StopStreaming => write!(f, "SYSTem:StopStreamData"),
            DeviceCommand::SetAnalogChannelMask(mask) => write!(f, "ENAble:VOLTage:DC {mask}"),
            DeviceCommand::EnableDigitalPorts(on) => write!(f, "DIO:PORt:ENAble {}", u8::from(*on)),
            DeviceCommand::SetDigitalDirection(index, dir) => {
                let dir = match dir {
                    ChannelDirection::Input => 0,
                    ChannelDirection::Output => 1,
                };
                write!(f, "DIO:PORt:DIRection {index},{dir}")
            }
            DeviceCommand::EnableNetwork(on) => {
                write!(f, "SYSTem:COMMunicate:LAN:ENAbled {}", u8::from(*on))
            }
            DeviceCommand::EnableSdCard(on) => {
                write!(f, "SYSTem:STORage:SD:ENAble {}", u8::from(*on))
            }
            DeviceCommand::SetSdLogFileName(name) => {
                write!(f, "SYSTem:STORage:SD:LOGging \"{name}\"")
            }
            DeviceCommand::ListSdFiles => write!(f, "SYSTem:STORage:SD:LIST?"),
            DeviceCommand::GetSdFile(name) => write!(f, "SYSTem:STORage:SD:GET \"{name}\""),
            DeviceCommand::DeleteSdFile(name) => write!(f, "SYSTem:STORage:SD:DELete \"{name}\""),
            DeviceCommand::SetProtobufStreamFormat => write!(f, "SYSTem:STReam:FORmat 0"),
            DeviceCommand::DisableEcho => write!(f, "SYSTem:ECHO -1"),
            DeviceCommand::PowerOn => write!(f, "SYSTem:POWer:STATe 1"),
            DeviceCommand::Reboot => write!(f, "SYSTem:REboot"),
        }
    }
}

impl DeviceCommand {
    /// Sent on every connect, before the first device-info request.
    pub const INIT_SEQUENCE: [DeviceCommand; 3] = [
        DeviceCommand::DisableEcho,
        DeviceCommand::PowerOn,
        DeviceCommand::SetProtobufStreamFormat,
    ];

    /// Bytes on the wire, including the terminator.
    pub fn to_wire(&self) -> Vec<u8> {
        format!("{self}\r\n").into_bytes()
    }
}
