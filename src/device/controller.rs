//! Per-device protocol state machine.
//!
//! A [`DaqDevice`] owns one transport. Its reader is driven by exactly one
//! consumer task at a time (see [`crate::protocol::consumer`]) which feeds an
//! `mpsc` queue; the device processes that queue in order from
//! [`DaqDevice::process_next`]. Two pieces of state decide what happens to each
//! item:
//!
//! - [`DeviceMode`]: whether samples go to the host or to the SD card.
//! - [`Handler`]: how the next inbound item is interpreted.
//!
//! ```text
//!  initialize ──► Status ──(valid status)──► Streaming ◄──┐
//!                   │ ▲                         │         │
//!                   └─┘ (invalid: ask again)    │ refresh │ file list received
//!                                               ▼         │
//!                                           SdCardList ───┘
//! ```
//!
//! A mode switch, stream start or log start abandons a listing that never got
//! an answer.
//!
//! Switching consumers is always "stop the old one, drain the queue, start the
//! new one, wait the settle delay". The device does not acknowledge interface
//! changes, so the settle delay is the only synchronization.

use super::channel::{AnalogCalibration, ChannelDescriptor, ChannelDirection, ChannelKind};
use super::command::DeviceCommand;
use super::mask::ChannelMask;
use super::{ConnectionKind, DeviceIdentity, DeviceMetadata, DeviceMode};
use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use crate::protocol::{
    spawn_consumer, BoxReader, CommandProducer, ConsumerHandle, ConsumerKind, DeviceMessage,
    DeviceTransport, Inbound,
};
use crate::sdcard::{
    contains_file_markers, log_file_name, parse_file_list, DownloadResult, SdCardFileMeta,
};
use crate::stream::{process_message, DeviceEvent, DeviceTimeState, Reconstructed};
use chrono::{Local, Utc};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Which interpretation applies to inbound items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Waiting for a valid status reply
    Status,
    /// Streaming messages are demultiplexed into samples
    Streaming,
    /// Waiting for the SD-card file list
    SdCardList,
}

/// Timing and sizing of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// Rate requested when streaming or logging
    pub frequency_hz: u32,
    /// Pause after attaching a consumer or switching interfaces
    pub settle_delay: Duration,
    /// Interval between device-info requests while waiting for status
    pub status_retry: Duration,
    /// Silence that ends a text or raw response
    pub text_idle: Duration,
    /// Capacity of the inbound queue and the event channel
    pub channel_capacity: usize,
}

impl DeviceSettings {
    /// Settings from the application configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            frequency_hz: config.streaming.frequency_hz,
            settle_delay: config.streaming.settle_delay(),
            status_retry: config.streaming.status_retry(),
            text_idle: config.transport.text_idle(),
            channel_capacity: config.transport.channel_capacity.max(1),
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// A connected DAQ device.
pub struct DaqDevice {
    identity: DeviceIdentity,
    channels: Vec<ChannelDescriptor>,
    mode: DeviceMode,
    handler: Handler,
    ready: bool,
    closed: bool,
    is_streaming: bool,
    is_logging_to_sd: bool,
    time_state: Option<DeviceTimeState>,
    sd_card_files: Vec<SdCardFileMeta>,

    producer: CommandProducer,
    reader: Option<BoxReader>,
    consumer: Option<ConsumerHandle>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    events: broadcast::Sender<DeviceEvent>,
    settings: DeviceSettings,
}

impl std::fmt::Debug for DaqDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaqDevice")
            .field("identity", &self.identity)
            .field("mode", &self.mode)
            .field("handler", &self.handler)
            .field("is_streaming", &self.is_streaming)
            .field("is_logging_to_sd", &self.is_logging_to_sd)
            .finish_non_exhaustive()
    }
}

impl DaqDevice {
    /// Device on `transport` whose identity is not known yet.
    pub fn new(transport: DeviceTransport, connection: ConnectionKind, settings: DeviceSettings) -> Self {
        Self::with_identity(transport, DeviceIdentity::unidentified(connection), settings)
    }

    /// Device on `transport` with a known identity (for example from discovery).
    pub fn with_identity(
        transport: DeviceTransport,
        identity: DeviceIdentity,
        settings: DeviceSettings,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.channel_capacity);
        let (events, _) = broadcast::channel(settings.channel_capacity);
        Self {
            identity,
            channels: Vec::new(),
            mode: DeviceMode::StreamToApp,
            handler: Handler::Status,
            ready: false,
            closed: false,
            is_streaming: false,
            is_logging_to_sd: false,
            time_state: None,
            sd_card_files: Vec::new(),
            producer: CommandProducer::new(transport.writer),
            reader: Some(transport.reader),
            consumer: None,
            inbound_tx,
            inbound_rx,
            events,
            settings,
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Identity, filled in from the status reply.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Channels hydrated from the status reply.
    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    /// Look up one channel.
    pub fn channel(&self, kind: ChannelKind, index: u32) -> Option<&ChannelDescriptor> {
        self.channels
            .iter()
            .find(|ch| ch.kind == kind && ch.index == index)
    }

    /// Identity and channel configuration, for importing logs later.
    pub fn metadata(&self) -> DeviceMetadata {
        DeviceMetadata {
            identity: self.identity.clone(),
            channels: self.channels.clone(),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Current handler.
    pub fn handler(&self) -> Handler {
        self.handler
    }

    /// Whether a valid status reply has been received.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether the device is streaming (to the host or to its SD card).
    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    /// Whether the device is logging to its SD card.
    pub fn is_logging_to_sd(&self) -> bool {
        self.is_logging_to_sd
    }

    /// Timestamp baseline of the current streaming session.
    pub fn time_state(&self) -> Option<&DeviceTimeState> {
        self.time_state.as_ref()
    }

    /// Files from the last SD-card listing.
    pub fn sd_card_files(&self) -> &[SdCardFileMeta] {
        &self.sd_card_files
    }

    /// Subscribe to samples and other device events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    async fn send(&mut self, command: &DeviceCommand) -> AppResult<()> {
        self.producer.send(command).await
    }

    async fn settle(&self) {
        tokio::time::sleep(self.settings.settle_delay).await;
    }

    // ---------------------------------------------------------------------
    // Consumers
    // ---------------------------------------------------------------------

    async fn attach_consumer(&mut self, kind: ConsumerKind) -> AppResult<()> {
        let reader = match self.consumer.take() {
            Some(handle) => handle.stop().await?,
            None => self.reader.take().ok_or(DaqError::TransportClosed)?,
        };

        let mut dropped = 0usize;
        while self.inbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded queued input while switching consumer");
        }

        self.consumer = Some(spawn_consumer(
            kind,
            reader,
            self.inbound_tx.clone(),
            self.settings.text_idle,
        ));
        self.settle().await;
        Ok(())
    }

    async fn restore_streaming(&mut self) -> AppResult<()> {
        self.attach_consumer(ConsumerKind::Binary).await?;
        self.handler = Handler::Streaming;
        Ok(())
    }

    /// Abandon a pending SD-card listing and make sure the binary consumer
    /// reads the transport again.
    async fn leave_sd_card_listing(&mut self) -> AppResult<()> {
        let attached = self.consumer.as_ref().map(ConsumerHandle::kind);
        let foreign_consumer = attached.is_some() && attached != Some(ConsumerKind::Binary);
        if self.handler == Handler::SdCardList {
            debug!(device = %self.identity, "Abandoning pending SD card file listing");
            self.restore_streaming().await
        } else if foreign_consumer {
            self.attach_consumer(ConsumerKind::Binary).await
        } else {
            Ok(())
        }
    }

    // ---------------------------------------------------------------------
    // Status handshake
    // ---------------------------------------------------------------------

    /// Bring the device into a known state and ask it to describe itself.
    ///
    /// Echo goes off first, otherwise echoed commands land in the binary stream.
    #[instrument(skip(self), fields(device = %self.identity))]
    pub async fn initialize(&mut self) -> AppResult<()> {
        if self.consumer.as_ref().map(ConsumerHandle::kind) != Some(ConsumerKind::Binary) {
            self.attach_consumer(ConsumerKind::Binary).await?;
        }
        self.handler = Handler::Status;
        self.ready = false;
        for command in DeviceCommand::INIT_SEQUENCE {
            self.send(&command).await?;
        }
        self.settle().await;
        self.send(&DeviceCommand::RequestDeviceInfo).await
    }

    /// Process input until the device reports a valid status, asking again
    /// every `status_retry` of silence.
    pub async fn wait_until_ready(&mut self, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        while !self.ready {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DaqError::Timeout(
                    timeout.as_millis() as u64,
                    "waiting for device status".to_string(),
                ));
            }
            let wait = remaining.min(self.settings.status_retry);
            match tokio::time::timeout(wait, self.inbound_rx.recv()).await {
                Ok(Some(inbound)) => {
                    if !self.handle(inbound).await? {
                        return Err(DaqError::TransportClosed);
                    }
                }
                Ok(None) => return Err(DaqError::TransportClosed),
                Err(_) => {
                    debug!(device = %self.identity, "No status reply yet, requesting device info again");
                    self.send(&DeviceCommand::RequestDeviceInfo).await?;
                }
            }
        }
        Ok(())
    }

    /// Fill identity and channels from a status reply.
    ///
    /// Channels are created once per connection; later status replies only
    /// refresh the identity.
    pub fn apply_status(&mut self, status: &DeviceMessage) {
        let serial = status.serial_number();
        if !serial.is_empty() {
            self.identity.serial_number = serial;
        }
        if !status.device_pn.is_empty() {
            self.identity.part_number = status.device_pn.clone();
        }
        if !status.device_fw_rev.is_empty() {
            self.identity.firmware_version = status.device_fw_rev.clone();
        }

        if !self.channels.is_empty() {
            return;
        }

        let resolution = if status.analog_in_res == 0 {
            1.0
        } else {
            f64::from(status.analog_in_res)
        };
        let entry = |values: &[f32], i: usize, default: f64| {
            values.get(i).map(|v| f64::from(*v)).unwrap_or(default)
        };

        for i in 0..status.analog_in_port_num {
            let pos = i as usize;
            self.channels.push(ChannelDescriptor::analog(
                i,
                AnalogCalibration {
                    resolution,
                    port_range: entry(&status.analog_in_port_range, pos, 1.0),
                    calibration_m: entry(&status.analog_in_cal_m, pos, 1.0),
                    calibration_b: entry(&status.analog_in_cal_b, pos, 0.0),
                    internal_scale_m: entry(&status.analog_in_int_scale_m, pos, 1.0),
                },
            ));
        }
        for i in 0..status.digital_port_num {
            self.channels
                .push(ChannelDescriptor::digital(i, ChannelDirection::Input));
        }
    }

    // ---------------------------------------------------------------------
    // Message loop
    // ---------------------------------------------------------------------

    /// Handle the next inbound item. Returns `false` once the transport closed.
    pub async fn process_next(&mut self) -> AppResult<bool> {
        if self.closed || self.consumer.is_none() {
            return Ok(false);
        }
        match self.inbound_rx.recv().await {
            Some(inbound) => self.handle(inbound).await,
            None => Ok(false),
        }
    }

    /// Process input until the transport closes.
    pub async fn run(&mut self) -> AppResult<()> {
        while self.process_next().await? {}
        Ok(())
    }

    async fn handle(&mut self, inbound: Inbound) -> AppResult<bool> {
        match inbound {
            Inbound::Closed => {
                info!(device = %self.identity, "Transport closed");
                self.closed = true;
                self.is_streaming = false;
                self.is_logging_to_sd = false;
                self.time_state = None;
                return Ok(false);
            }
            Inbound::Message(message) => match self.handler {
                Handler::Status => self.handle_status(&message).await?,
                Handler::Streaming => self.handle_streaming(&message),
                Handler::SdCardList => {
                    debug!("Ignoring device message while listing SD card files")
                }
            },
            Inbound::Text(text) => match self.handler {
                Handler::SdCardList => self.handle_file_list(&text).await?,
                _ => debug!(bytes = text.len(), "Ignoring unexpected text response"),
            },
            Inbound::Raw(bytes) => debug!(bytes = bytes.len(), "Ignoring unexpected raw response"),
        }
        Ok(true)
    }

    async fn handle_status(&mut self, status: &DeviceMessage) -> AppResult<()> {
        if !status.is_valid_status() {
            debug!(device = %self.identity, "Status reply reports no ports, requesting device info again");
            return self.send(&DeviceCommand::RequestDeviceInfo).await;
        }

        self.apply_status(status);
        self.handler = Handler::Streaming;
        self.ready = true;
        info!(
            device = %self.identity,
            analog = status.analog_in_port_num,
            digital = status.digital_port_num,
            firmware = %status.device_fw_rev,
            "Device status received"
        );
        self.emit(DeviceEvent::StatusUpdated(self.identity.clone()));
        Ok(())
    }

    fn handle_streaming(&mut self, message: &DeviceMessage) {
        if !message.has_timestamp() {
            warn!(device = %self.identity, "Dropping message without timestamp");
            return;
        }

        let tick = message.msg_time_stamp;
        let stamp = match self.time_state.as_mut() {
            Some(state) => state.advance(tick),
            None => {
                let now = Utc::now();
                self.time_state = Some(DeviceTimeState::new(now, tick));
                Reconstructed {
                    timestamp: now,
                    rollover: false,
                }
            }
        };

        let (samples, summary) = process_message(
            &self.identity.serial_number,
            &mut self.channels,
            message,
            stamp.timestamp,
            stamp.rollover,
        );
        for sample in samples {
            self.emit(DeviceEvent::Sample(sample));
        }
        self.emit(DeviceEvent::Message(summary));
    }

    async fn handle_file_list(&mut self, text: &str) -> AppResult<()> {
        if !contains_file_markers(text) {
            debug!(bytes = text.len(), "Response does not list any log files yet");
            return Ok(());
        }

        let files = parse_file_list(text);
        info!(device = %self.identity, count = files.len(), "SD card file list received");
        self.sd_card_files = files.clone();
        self.emit(DeviceEvent::SdCardFiles(files));
        self.restore_streaming().await
    }

    // ---------------------------------------------------------------------
    // Channels
    // ---------------------------------------------------------------------

    /// Activate a channel and tell the device.
    pub async fn activate_channel(&mut self, kind: ChannelKind, index: u32) -> AppResult<()> {
        self.set_channel_active(kind, index, true).await
    }

    /// Deactivate a channel and tell the device.
    pub async fn deactivate_channel(&mut self, kind: ChannelKind, index: u32) -> AppResult<()> {
        self.set_channel_active(kind, index, false).await
    }

    async fn set_channel_active(&mut self, kind: ChannelKind, index: u32, active: bool) -> AppResult<()> {
        let Some(pos) = self
            .channels
            .iter()
            .position(|ch| ch.kind == kind && ch.index == index)
        else {
            warn!(device = %self.identity, ?kind, index, "Channel does not belong to this device");
            return Ok(());
        };

        let command = match kind {
            ChannelKind::Analog => {
                let next = ChannelMask::from_active(&self.channels).and_then(|mask| {
                    if active {
                        mask.with(index)
                    } else {
                        mask.without(index)
                    }
                });
                match next {
                    Ok(mask) => DeviceCommand::SetAnalogChannelMask(mask),
                    Err(e) => {
                        warn!(device = %self.identity, error = %e, "Channel cannot be addressed");
                        return Ok(());
                    }
                }
            }
            ChannelKind::Digital => {
                let others_active = self.channels.iter().any(|ch| {
                    ch.kind == ChannelKind::Digital && ch.is_active && ch.index != index
                });
                DeviceCommand::EnableDigitalPorts(active || others_active)
            }
        };

        self.send(&command).await?;
        self.channels[pos].is_active = active;
        debug!(device = %self.identity, channel = %self.channels[pos].name(), active, "Channel updated");
        Ok(())
    }

    /// Set the direction of a digital line.
    pub async fn set_digital_direction(&mut self, index: u32, direction: ChannelDirection) -> AppResult<()> {
        let Some(pos) = self
            .channels
            .iter()
            .position(|ch| ch.kind == ChannelKind::Digital && ch.index == index)
        else {
            warn!(device = %self.identity, index, "Digital channel does not belong to this device");
            return Ok(());
        };
        self.send(&DeviceCommand::SetDigitalDirection(index, direction))
            .await?;
        self.channels[pos].direction = direction;
        Ok(())
    }

    fn active_mask(&self) -> AppResult<ChannelMask> {
        ChannelMask::from_active(&self.channels)
    }

    fn any_digital_active(&self) -> bool {
        self.channels
            .iter()
            .any(|ch| ch.kind == ChannelKind::Digital && ch.is_active)
    }

    // ---------------------------------------------------------------------
    // Streaming and modes
    // ---------------------------------------------------------------------

    /// Start streaming to the host at `frequency_hz`.
    pub async fn start_streaming(&mut self, frequency_hz: u32) -> AppResult<()> {
        if self.is_logging_to_sd {
            return Err(DaqError::Busy(
                "SD card logging is active; stop it before streaming".to_string(),
            ));
        }
        if self.mode != DeviceMode::StreamToApp {
            return Err(DaqError::InvalidMode {
                operation: "Streaming to the host",
                mode: self.mode,
            });
        }
        if !self.ready {
            return Err(DaqError::NotReady);
        }
        self.leave_sd_card_listing().await?;
        self.send(&DeviceCommand::StartStreaming(frequency_hz)).await?;
        self.time_state = None;
        self.is_streaming = true;
        info!(device = %self.identity, frequency_hz, "Streaming started");
        Ok(())
    }

    /// Stop streaming. The next session starts with a fresh timestamp baseline.
    pub async fn stop_streaming(&mut self) -> AppResult<()> {
        if !self.is_streaming {
            return Ok(());
        }
        self.send(&DeviceCommand::StopStreaming).await?;
        self.is_streaming = false;
        self.time_state = None;
        info!(device = %self.identity, "Streaming stopped");
        Ok(())
    }

    /// Switch between streaming to the host and logging to the SD card.
    #[instrument(skip(self), fields(device = %self.identity))]
    pub async fn switch_mode(&mut self, mode: DeviceMode) -> AppResult<()> {
        self.leave_sd_card_listing().await?;
        if mode == self.mode {
            return Ok(());
        }
        if mode == DeviceMode::LogToDevice && !self.identity.connection.supports_sd_card() {
            return Err(DaqError::UsbRequired {
                operation: "SD card logging",
            });
        }

        if self.is_logging_to_sd {
            self.stop_sd_card_logging().await?;
        }
        self.stop_streaming().await?;

        // Network and SD share a bus; tear down one before bringing up the other
        match self.mode {
            DeviceMode::StreamToApp => self.send(&DeviceCommand::EnableNetwork(false)).await?,
            DeviceMode::LogToDevice => self.send(&DeviceCommand::EnableSdCard(false)).await?,
        }
        self.settle().await;

        self.mode = mode;
        match mode {
            DeviceMode::StreamToApp => self.send(&DeviceCommand::EnableNetwork(true)).await?,
            DeviceMode::LogToDevice => self.send(&DeviceCommand::EnableSdCard(true)).await?,
        }
        self.settle().await;

        info!(?mode, "Device mode switched");
        Ok(())
    }

    fn require_sd_access(&self, operation: &'static str) -> AppResult<()> {
        if !self.identity.connection.supports_sd_card() {
            return Err(DaqError::UsbRequired { operation });
        }
        if self.mode != DeviceMode::LogToDevice {
            return Err(DaqError::InvalidMode {
                operation,
                mode: self.mode,
            });
        }
        Ok(())
    }

    /// Start logging the active channels to a new file on the SD card.
    /// Returns the file name.
    pub async fn start_sd_card_logging(&mut self) -> AppResult<String> {
        self.require_sd_access("SD card logging")?;
        if self.is_logging_to_sd {
            return Err(DaqError::Busy("SD card logging is already active".to_string()));
        }

        self.leave_sd_card_listing().await?;

        let file_name = log_file_name(Local::now().naive_local());
        let mask = self.active_mask()?;
        let digital = self.any_digital_active();
        let frequency = self.settings.frequency_hz;

        self.send(&DeviceCommand::SetProtobufStreamFormat).await?;
        self.send(&DeviceCommand::SetSdLogFileName(file_name.clone()))
            .await?;
        self.send(&DeviceCommand::SetAnalogChannelMask(mask)).await?;
        self.send(&DeviceCommand::EnableDigitalPorts(digital)).await?;
        self.send(&DeviceCommand::StartStreaming(frequency)).await?;

        self.is_logging_to_sd = true;
        self.is_streaming = true;
        info!(device = %self.identity, file = %file_name, %mask, "SD card logging started");
        Ok(file_name)
    }

    /// Stop SD-card logging.
    pub async fn stop_sd_card_logging(&mut self) -> AppResult<()> {
        self.require_sd_access("SD card logging")?;
        if !self.is_logging_to_sd {
            return Ok(());
        }
        self.send(&DeviceCommand::StopStreaming).await?;
        self.is_logging_to_sd = false;
        self.is_streaming = false;
        self.time_state = None;
        info!(device = %self.identity, "SD card logging stopped");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // SD card files
    // ---------------------------------------------------------------------

    /// Ask for the SD-card file list. The answer arrives through
    /// [`DaqDevice::process_next`] as [`DeviceEvent::SdCardFiles`].
    pub async fn refresh_sd_card_files(&mut self) -> AppResult<()> {
        self.require_sd_access("SD card file listing")?;
        if self.is_logging_to_sd {
            return Err(DaqError::Busy(
                "SD card logging is active; stop it before listing files".to_string(),
            ));
        }
        self.attach_consumer(ConsumerKind::Text).await?;
        self.handler = Handler::SdCardList;
        if let Err(e) = self.send(&DeviceCommand::ListSdFiles).await {
            self.restore_streaming().await?;
            return Err(e);
        }
        Ok(())
    }

    /// Refresh and wait for the file list. An empty card never answers with a
    /// file, so silence until `timeout` means no files.
    pub async fn list_sd_card_files(&mut self, timeout: Duration) -> AppResult<Vec<SdCardFileMeta>> {
        self.refresh_sd_card_files().await?;

        let deadline = Instant::now() + timeout;
        while self.handler == Handler::SdCardList {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.inbound_rx.recv()).await {
                Ok(Some(inbound)) => {
                    if !self.handle(inbound).await? {
                        return Err(DaqError::TransportClosed);
                    }
                }
                Ok(None) => return Err(DaqError::TransportClosed),
                Err(_) => {
                    debug!(device = %self.identity, "No SD card files reported");
                    self.sd_card_files.clear();
                    self.restore_streaming().await?;
                }
            }
        }
        Ok(self.sd_card_files.clone())
    }

    async fn next_raw(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.inbound_rx.recv().await? {
                Inbound::Raw(bytes) => return Some(bytes),
                Inbound::Closed => {
                    self.closed = true;
                    return None;
                }
                _ => debug!("Ignoring non-raw input during download"),
            }
        }
    }

    /// Download one file from the SD card.
    pub async fn download_sd_card_file(
        &mut self,
        file_name: &str,
        timeout: Duration,
    ) -> AppResult<DownloadResult> {
        self.require_sd_access("SD card download")?;
        if self.is_logging_to_sd {
            return Err(DaqError::Busy(
                "SD card logging is active; stop it before downloading".to_string(),
            ));
        }

        self.attach_consumer(ConsumerKind::Raw).await?;
        if let Err(e) = self.send(&DeviceCommand::GetSdFile(file_name.to_string())).await {
            self.restore_streaming().await?;
            return Err(e);
        }

        let received = tokio::time::timeout(timeout, self.next_raw())
            .await
            .ok()
            .flatten();
        self.restore_streaming().await?;

        match received {
            Some(content) if !content.is_empty() => {
                info!(device = %self.identity, file = file_name, bytes = content.len(), "SD card file downloaded");
                Ok(DownloadResult::Completed {
                    file_name: file_name.to_string(),
                    content,
                })
            }
            _ => {
                warn!(device = %self.identity, file = file_name, "SD card download returned no data");
                Ok(DownloadResult::Failed(
                    crate::sdcard::importer::EMPTY_CONTENT.to_string(),
                ))
            }
        }
    }

    /// Delete one file from the SD card.
    pub async fn delete_sd_card_file(&mut self, file_name: &str) -> AppResult<()> {
        self.require_sd_access("SD card file deletion")?;
        if self.is_logging_to_sd {
            return Err(DaqError::Busy(
                "SD card logging is active; stop it before deleting files".to_string(),
            ));
        }
        self.send(&DeviceCommand::DeleteSdFile(file_name.to_string()))
            .await?;
        self.sd_card_files.retain(|f| f.file_name != file_name);
        info!(device = %self.identity, file = file_name, "SD card file deleted");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Reboot the device. It must be initialized again afterwards.
    pub async fn reboot(&mut self) -> AppResult<()> {
        self.send(&DeviceCommand::Reboot).await?;
        self.is_streaming = false;
        self.is_logging_to_sd = false;
        self.time_state = None;
        self.ready = false;
        self.handler = Handler::Status;
        info!(device = %self.identity, "Device rebooting");
        Ok(())
    }

    /// Stop streaming, detach the consumer and close the write half.
    pub async fn shutdown(mut self) -> AppResult<()> {
        if self.is_streaming && !self.closed {
            if self.is_logging_to_sd {
                self.stop_sd_card_logging().await?;
            } else {
                self.stop_streaming().await?;
            }
        }
        if let Some(handle) = self.consumer.take() {
            handle.stop().await?;
        }
        self.producer.shutdown().await
    }
}
