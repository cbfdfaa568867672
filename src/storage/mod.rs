//! Sample sinks.
//!
//! The import pipeline (and the CLI's live recorder) hand samples to a
//! [`SampleSink`] in batches. The durable backend is not part of this crate;
//! [`MemorySink`] keeps everything in memory and [`CsvSink`] appends to a CSV file.

pub mod csv;

pub use self::csv::CsvSink;

use crate::error::{AppResult, DaqError};
use crate::stream::DataSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a logging session in a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session record created before the first batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Human-readable name (the imported file name, or the live device)
    pub name: String,
    /// Serial number of the device the samples came from
    pub serial: String,
    /// Time of the first sample
    pub started_at: DateTime<Utc>,
}

/// Destination for samples.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Create a session; every later batch is tagged with the returned id.
    async fn create_session(&self, info: &SessionInfo) -> AppResult<SessionId>;

    /// Insert one batch. A batch is stored entirely or not at all.
    async fn insert_batch(&self, session: SessionId, samples: &[DataSample]) -> AppResult<()>;

    /// Flush buffered output.
    async fn flush(&self) -> AppResult<()> {
        Ok(())
    }
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    sessions: Mutex<Vec<SessionInfo>>,
    batches: Mutex<Vec<(SessionId, Vec<DataSample>)>>,
    fail_on_batch: Mutex<Option<usize>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th `insert_batch` call (zero-based) fail.
    pub fn fail_on_batch(&self, n: usize) {
        *self.fail_on_batch.lock() = Some(n);
    }

    /// Sessions created so far.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.lock().clone()
    }

    /// Sizes of the stored batches, in insertion order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(|(_, b)| b.len()).collect()
    }

    /// Every stored sample of `session`.
    pub fn samples(&self, session: SessionId) -> Vec<DataSample> {
        self.batches
            .lock()
            .iter()
            .filter(|(id, _)| *id == session)
            .flat_map(|(_, b)| b.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl SampleSink for MemorySink {
    async fn create_session(&self, info: &SessionInfo) -> AppResult<SessionId> {
        let mut sessions = self.sessions.lock();
        sessions.push(info.clone());
        Ok(SessionId(sessions.len() as u64))
    }

    async fn insert_batch(&self, session: SessionId, samples: &[DataSample]) -> AppResult<()> {
        let mut batches = self.batches.lock();
        if *self.fail_on_batch.lock() == Some(batches.len()) {
            return Err(DaqError::Sink(format!(
                "Insert of batch {} rejected",
                batches.len()
            )));
        }
        batches.push((session, samples.to_vec()));
        Ok(())
    }
}
