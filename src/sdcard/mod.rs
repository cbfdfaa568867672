//! On-device SD-card logs: file listing, offline parsing and import.
//!
//! Devices in `LogToDevice` mode write the same length-prefixed messages they
//! would stream into `log_YYYYMMDD_HHMMSS.bin` files. After download, the bytes
//! are replayed through the streaming path by [`SdCardLogParser`] and stored
//! through a [`crate::storage::SampleSink`] by [`SdCardImporter`].

pub mod colors;
pub mod importer;
pub mod parser;

pub use colors::ChannelColorMap;
pub use importer::{
    DownloadResult, ImportOutcome, ImportProgress, ImportRequest, ProgressFn, SdCardImporter,
};
pub use parser::{ParsedLog, SdCardLogParser};

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Marker present in every file-list response that names at least one log.
pub const FILE_MARKER: &str = ".bin";

/// A file on the device's SD card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdCardFileMeta {
    /// File name without directory
    pub file_name: String,
    /// Creation time encoded in the name; `None` for names that do not follow
    /// the `log_YYYYMMDD_HHMMSS` pattern
    pub created: Option<NaiveDateTime>,
}

impl SdCardFileMeta {
    /// Metadata for `file_name`.
    pub fn new(file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let created = parse_creation_date(&file_name);
        Self { file_name, created }
    }
}

fn log_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"log_(\d{8})_(\d{6})").ok())
        .as_ref()
}

/// Creation time encoded in a log file name.
pub fn parse_creation_date(file_name: &str) -> Option<NaiveDateTime> {
    let caps = log_name_pattern()?.captures(file_name)?;
    let stamp = format!("{}{}", caps.get(1)?.as_str(), caps.get(2)?.as_str());
    NaiveDateTime::parse_from_str(&stamp, "%Y%m%d%H%M%S").ok()
}

/// Whether a text response looks like a file list.
pub fn contains_file_markers(response: &str) -> bool {
    response.contains(FILE_MARKER)
}

/// Parse a file-list response, one entry per line.
///
/// Blank lines and echoed commands are skipped; directory prefixes are removed.
pub fn parse_file_list(response: &str) -> Vec<SdCardFileMeta> {
    response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("SYSTem:"))
        .map(|line| line.rsplit(['/', '\\']).next().unwrap_or(line))
        .filter(|name| !name.is_empty())
        .map(SdCardFileMeta::new)
        .collect()
}

/// Name of a new log file started at `at`.
pub fn log_file_name(at: NaiveDateTime) -> String {
    at.format("log_%Y%m%d_%H%M%S.bin").to_string()
}
