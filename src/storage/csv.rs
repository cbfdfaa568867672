//! CSV sample sink.
//!
//! One file holds any number of sessions; each row is tagged with its session:
//! `session_id,serial,channel,timestamp,value`.
use super::{SampleSink, SessionId, SessionInfo};
use crate::error::AppResult;
#[cfg(not(feature = "storage_csv"))]
use crate::error::DaqError;
use crate::stream::DataSample;
use async_trait::async_trait;
use std::path::Path;

/// A sink writing CSV files.
///
/// Each batch is serialized in memory and appended with a single write on the
/// blocking pool. A failed append truncates the file back to its previous
/// length.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    path: std::path::PathBuf,
    file: std::sync::Arc<parking_lot::Mutex<std::fs::File>>,
    next_session: std::sync::atomic::AtomicU64,
}

#[cfg(feature = "storage_csv")]
#[derive(serde::Serialize)]
struct CsvRow<'a> {
    session_id: u64,
    serial: &'a str,
    channel: &'a str,
    timestamp: String,
    value: f64,
}

#[cfg(feature = "storage_csv")]
const HEADER: [&str; 5] = ["session_id", "serial", "channel", "timestamp", "value"];

#[cfg(feature = "storage_csv")]
fn append_all(file: &mut std::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    let committed = file.seek(SeekFrom::End(0))?;
    let written = file.write_all(bytes).and_then(|()| file.flush());
    if let Err(e) = written {
        file.set_len(committed)?;
        file.seek(SeekFrom::Start(committed))?;
        return Err(e);
    }
    Ok(())
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Create (or truncate) `path` and write the header.
    pub fn create<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut header = ::csv::Writer::from_writer(Vec::new());
        header.write_record(HEADER)?;
        let header = header.into_inner().map_err(|e| e.into_error())?;

        let mut file = std::fs::File::create(&path)?;
        append_all(&mut file, &header)?;
        tracing::info!(path = %path.display(), "CSV sink created");
        Ok(Self {
            path,
            file: std::sync::Arc::new(parking_lot::Mutex::new(file)),
            next_session: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Output file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl SampleSink for CsvSink {
    async fn create_session(&self, info: &SessionInfo) -> AppResult<SessionId> {
        let id = self
            .next_session
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(session = id, name = %info.name, serial = %info.serial, "CSV session started");
        Ok(SessionId(id))
    }

    async fn insert_batch(&self, session: SessionId, samples: &[DataSample]) -> AppResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut rows = ::csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for sample in samples {
            rows.serialize(CsvRow {
                session_id: session.0,
                serial: &sample.serial,
                channel: &sample.channel,
                timestamp: sample.timestamp.to_rfc3339(),
                value: sample.value,
            })?;
        }
        let bytes = rows.into_inner().map_err(|e| e.into_error())?;

        let file = self.file.clone();
        tokio::task::spawn_blocking(move || append_all(&mut file.lock(), &bytes)).await??;
        Ok(())
    }

    async fn flush(&self) -> AppResult<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || file.lock().sync_data()).await??;
        Ok(())
    }
}

/// Placeholder when CSV support is compiled out.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvSink;

#[cfg(not(feature = "storage_csv"))]
impl CsvSink {
    /// Always fails: CSV support is not compiled in.
    pub fn create<P: AsRef<Path>>(_path: P) -> AppResult<Self> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(not(feature = "storage_csv"))]
#[async_trait]
impl SampleSink for CsvSink {
    async fn create_session(&self, _info: &SessionInfo) -> AppResult<SessionId> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    async fn insert_batch(&self, _session: SessionId, _samples: &[DataSample]) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}
