//! Streaming data path: timestamp reconstruction, demultiplexing and the
//! events a live device publishes.
//!
//! The same functions serve the live stream and the SD-card log parser.

pub mod demux;
pub mod event;
pub mod timestamp;

pub use demux::{demultiplex, process_message};
pub use event::{DataSample, DeviceEvent, DeviceMessageSummary};
pub use timestamp::{DeviceTimeState, Reconstructed, TimestampTracker};
