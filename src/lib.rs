//! # daqlink
//!
//! Host-side controller for multi-channel data-acquisition boards reachable over
//! USB-serial or WiFi/TCP.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered [`config::AppConfig`] (defaults, TOML file, `DAQLINK_` env).
//! - **`error`**: The crate-wide [`error::DaqError`] and [`error::AppResult`].
//! - **`logging`**: `tracing` subscriber setup.
//! - **`protocol`**: The length-prefixed protobuf `DeviceMessage`, its stream codec,
//!   and the swappable consumers that turn a transport into inbound messages.
//! - **`device`**: Channels, masks, SCPI commands, and [`device::DaqDevice`], the
//!   per-device state machine (status handshake, streaming, SD-card logging).
//! - **`stream`**: Timestamp reconstruction and per-channel demultiplexing.
//! - **`sdcard`**: File listing, the resynchronizing log parser, and the importer.
//! - **`storage`**: The [`storage::SampleSink`] trait with in-memory and CSV sinks.
//! - **`connection`**: Registry that keeps one connection per serial number.
//! - **`transport`**: Serial and TCP endpoints.

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod sdcard;
pub mod storage;
pub mod stream;
pub mod transport;

pub use config::AppConfig;
pub use device::{DaqDevice, DeviceIdentity, DeviceMode};
pub use error::{AppResult, DaqError};
