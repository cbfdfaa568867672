//! Import of downloaded SD-card logs into a sample sink.
//!
//! An import runs as its own task with its own cancellation token and its own
//! parser (and therefore its own timestamp state). Samples are flushed in
//! batches of `import.batch_size`. Cancellation is checked before every flush;
//! batches already flushed stay in the sink.

use super::colors::ChannelColorMap;
use super::parser::SdCardLogParser;
use super::parse_creation_date;
use crate::config::ImportConfig;
use crate::device::DeviceMetadata;
use crate::storage::{SampleSink, SessionId, SessionInfo};
use crate::stream::DataSample;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Failure message for an empty download or import.
pub const EMPTY_CONTENT: &str = "File content is empty";
/// Failure message for an import without device metadata.
pub const MISSING_DEVICE: &str = "Device is null";
/// Message of a cancelled import.
pub const CANCELLED: &str = "Import was cancelled";

/// Outcome of downloading a file from the SD card.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadResult {
    /// The file's bytes
    Completed {
        /// Requested file name
        file_name: String,
        /// Downloaded bytes
        content: Vec<u8>,
    },
    /// Human-readable reason
    Failed(String),
}

impl DownloadResult {
    /// Whether the download produced content.
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadResult::Completed { .. })
    }
}

/// A downloaded log and the device it came from.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Log file name; its encoded creation time anchors the first timestamp
    pub file_name: String,
    /// Raw log bytes
    pub content: Vec<u8>,
    /// Identity and channel configuration at recording time
    pub device: Option<DeviceMetadata>,
}

/// Progress after a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportProgress {
    /// Samples flushed so far
    pub processed: usize,
    /// Total samples expected, when known
    pub estimated_total: Option<usize>,
}

/// Progress callback.
pub type ProgressFn = Arc<dyn Fn(ImportProgress) + Send + Sync>;

/// Outcome of an import.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    /// Every sample was stored
    Completed {
        /// Session the samples were stored under
        session_id: SessionId,
        /// Number of samples stored
        samples_imported: usize,
        /// Display colors of the imported channels
        channel_colors: ChannelColorMap,
    },
    /// Cancelled between batches
    Cancelled,
    /// Human-readable reason
    Failed(String),
}

impl ImportOutcome {
    /// Whether the import completed.
    pub fn is_success(&self) -> bool {
        matches!(self, ImportOutcome::Completed { .. })
    }

    /// Message for callers that only show text.
    pub fn message(&self) -> String {
        match self {
            ImportOutcome::Completed {
                samples_imported, ..
            } => format!("Imported {samples_imported} samples"),
            ImportOutcome::Cancelled => CANCELLED.to_string(),
            ImportOutcome::Failed(msg) => msg.clone(),
        }
    }
}

/// Imports SD-card logs into a sink.
#[derive(Clone)]
pub struct SdCardImporter {
    sink: Arc<dyn SampleSink>,
    config: ImportConfig,
}

impl std::fmt::Debug for SdCardImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdCardImporter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SdCardImporter {
    /// Importer writing to `sink`.
    pub fn new(sink: Arc<dyn SampleSink>, config: ImportConfig) -> Self {
        Self { sink, config }
    }

    /// Run [`SdCardImporter::import`] as an independent task.
    pub fn spawn(
        &self,
        request: ImportRequest,
        cancel: CancellationToken,
        progress: Option<ProgressFn>,
    ) -> JoinHandle<ImportOutcome> {
        let importer = self.clone();
        tokio::spawn(async move { importer.import(request, &cancel, progress.as_ref()).await })
    }

    /// Parse and store one log.
    pub async fn import(
        &self,
        request: ImportRequest,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> ImportOutcome {
        if request.content.is_empty() {
            return ImportOutcome::Failed(EMPTY_CONTENT.to_string());
        }
        let Some(device) = request.device else {
            return ImportOutcome::Failed(MISSING_DEVICE.to_string());
        };

        let start = log_start_time(&request.file_name, Utc::now());

        let serial = device.identity.serial_number.clone();
        let mut channels = device.channels;
        let content = request.content;
        let config = self.config.clone();
        let parse_serial = serial.clone();

        let parsed = tokio::task::spawn_blocking(move || {
            let mut parser = SdCardLogParser::from_config(&config);
            parser.parse(&content, &parse_serial, &mut channels, start)
        })
        .await;

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => return ImportOutcome::Failed(format!("Parsing failed: {e}")),
        };

        if parsed.samples.is_empty() {
            warn!(file = %request.file_name, serial = %serial, "No samples found in log");
            return ImportOutcome::Failed("No samples found in file".to_string());
        }

        let info = SessionInfo {
            name: request.file_name,
            serial,
            started_at: start,
        };
        self.import_samples(&info, parsed.samples, cancel, progress)
            .await
    }

    /// Store already-parsed samples under a new session.
    pub async fn import_samples(
        &self,
        info: &SessionInfo,
        samples: Vec<DataSample>,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> ImportOutcome {
        let session_id = match self.sink.create_session(info).await {
            Ok(id) => id,
            Err(e) => return ImportOutcome::Failed(format!("Failed to create session: {e}")),
        };

        let total = samples.len();
        let mut colors = ChannelColorMap::new();
        let mut processed = 0usize;

        for batch in samples.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                info!(session = %session_id, processed, "Import cancelled");
                return ImportOutcome::Cancelled;
            }
            for sample in batch {
                colors.color_for(&sample.channel);
            }
            if let Err(e) = self.sink.insert_batch(session_id, batch).await {
                warn!(session = %session_id, processed, error = %e, "Batch insert failed");
                return ImportOutcome::Failed(e.to_string());
            }
            processed += batch.len();
            if let Some(report) = progress {
                report(ImportProgress {
                    processed,
                    estimated_total: Some(total),
                });
            }
        }

        if let Err(e) = self.sink.flush().await {
            return ImportOutcome::Failed(e.to_string());
        }

        info!(session = %session_id, samples = processed, "Import complete");
        ImportOutcome::Completed {
            session_id,
            samples_imported: processed,
            channel_colors: colors,
        }
    }
}

/// Time a log started, or `fallback` when the name carries none.
pub fn log_start_time(file_name: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
    parse_creation_date(file_name)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        AnalogCalibration, ChannelDescriptor, ConnectionKind, DeviceIdentity,
    };
    use crate::protocol::{encode_frame, DeviceMessage};
    use crate::storage::MemorySink;
    use parking_lot::Mutex;

    fn samples(n: usize) -> Vec<DataSample> {
        (0..n)
            .map(|i| DataSample {
                serial: "SN".to_string(),
                channel: format!("AI{}", i % 3),
                timestamp: Utc::now(),
                value: i as f64,
            })
            .collect()
    }

    fn session() -> SessionInfo {
        SessionInfo {
            name: "log_20241105_120000.bin".to_string(),
            serial: "SN".to_string(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn batches_of_1000_with_progress_after_each_flush() {
        let sink = Arc::new(MemorySink::new());
        let importer = SdCardImporter::new(sink.clone(), ImportConfig::default());

        let reports = Arc::new(Mutex::new(Vec::new()));
        let seen = reports.clone();
        let progress: ProgressFn = Arc::new(move |p| seen.lock().push(p));

        let outcome = importer
            .import_samples(&session(), samples(2500), &CancellationToken::new(), Some(&progress))
            .await;

        assert_eq!(sink.batch_sizes(), vec![1000, 1000, 500]);
        let processed: Vec<usize> = reports.lock().iter().map(|p| p.processed).collect();
        assert_eq!(processed, vec![1000, 2000, 2500]);
        assert!(reports
            .lock()
            .iter()
            .all(|p| p.estimated_total == Some(2500)));

        match outcome {
            ImportOutcome::Completed {
                session_id,
                samples_imported,
                channel_colors,
            } => {
                assert_eq!(samples_imported, 2500);
                assert_eq!(sink.samples(session_id).len(), 2500);
                assert_eq!(channel_colors.len(), 3);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_is_distinct_and_keeps_flushed_batches() {
        let sink = Arc::new(MemorySink::new());
        let importer = SdCardImporter::new(sink.clone(), ImportConfig::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let progress: ProgressFn = Arc::new(move |_| trigger.cancel());

        let outcome = importer
            .import_samples(&session(), samples(2500), &cancel, Some(&progress))
            .await;

        assert_eq!(outcome, ImportOutcome::Cancelled);
        assert_eq!(outcome.message(), CANCELLED);
        assert_eq!(sink.batch_sizes(), vec![1000]);
    }

    #[tokio::test]
    async fn sink_failure_becomes_failed_outcome() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_on_batch(1);
        let importer = SdCardImporter::new(sink.clone(), ImportConfig::default());

        let outcome = importer
            .import_samples(&session(), samples(2500), &CancellationToken::new(), None)
            .await;

        assert!(matches!(outcome, ImportOutcome::Failed(_)));
        assert_eq!(sink.batch_sizes(), vec![1000]);
    }

    #[tokio::test]
    async fn rejects_empty_content_and_missing_device() {
        let importer = SdCardImporter::new(Arc::new(MemorySink::new()), ImportConfig::default());
        let cancel = CancellationToken::new();

        let empty = importer
            .import(
                ImportRequest {
                    file_name: "log_20241105_120000.bin".to_string(),
                    content: Vec::new(),
                    device: None,
                },
                &cancel,
                None,
            )
            .await;
        assert_eq!(empty, ImportOutcome::Failed(EMPTY_CONTENT.to_string()));

        let no_device = importer
            .import(
                ImportRequest {
                    file_name: "log_20241105_120000.bin".to_string(),
                    content: vec![1, 2, 3],
                    device: None,
                },
                &cancel,
                None,
            )
            .await;
        assert_eq!(no_device, ImportOutcome::Failed(MISSING_DEVICE.to_string()));
    }

    #[tokio::test]
    async fn spawned_import_parses_and_stores_a_log() {
        let sink = Arc::new(MemorySink::new());
        let importer = SdCardImporter::new(sink.clone(), ImportConfig::default());

        let mut content = Vec::new();
        for i in 1..=5u32 {
            content.extend(encode_frame(&DeviceMessage {
                msg_time_stamp: i * 50_000,
                analog_in_data: vec![i as i32, -(i as i32)],
                device_status: 1,
                bat_status: 100,
                ..Default::default()
            }));
        }
        let device = DeviceMetadata {
            identity: DeviceIdentity::with_serial("7E28", ConnectionKind::Usb),
            channels: vec![
                ChannelDescriptor::analog(0, AnalogCalibration::default()).active(),
                ChannelDescriptor::analog(1, AnalogCalibration::default()).active(),
            ],
        };

        let handle = importer.spawn(
            ImportRequest {
                file_name: "log_20241105_120000.bin".to_string(),
                content,
                device: Some(device),
            },
            CancellationToken::new(),
            None,
        );
        let outcome = handle.await.unwrap();

        assert!(outcome.is_success(), "{}", outcome.message());
        assert_eq!(sink.batch_sizes(), vec![10]);
        let sessions = sink.sessions();
        assert_eq!(sessions[0].serial, "7E28");
        assert_eq!(
            sessions[0].started_at,
            log_start_time("log_20241105_120000.bin", Utc::now())
        );
    }
}
