//! Offline parser for downloaded SD-card logs.
//!
//! Log files are a concatenation of length-prefixed [`DeviceMessage`]s, but a
//! partial write or a power loss can leave garbage anywhere. The parser does not
//! trust prefixes on their own. At every offset it tries window lengths from
//! `min_len` to `max_len` and accepts the first window that decodes to exactly
//! one message with a non-zero timestamp. If no window fits, it skips one byte.
//!
//! [`DeviceMessage`]: crate::protocol::DeviceMessage

use crate::config::ImportConfig;
use crate::device::ChannelDescriptor;
use crate::protocol::{decode_exact_frame, DeviceMessage};
use crate::stream::{process_message, DataSample, TimestampTracker};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Result of parsing one log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLog {
    /// Samples in file order
    pub samples: Vec<DataSample>,
    /// Messages decoded
    pub messages: usize,
    /// Bytes skipped while resynchronizing
    pub skipped_bytes: usize,
}

/// Replays a log through timestamp reconstruction and demultiplexing.
///
/// The parser owns its timestamp state; call [`SdCardLogParser::reset`]
/// between unrelated files.
#[derive(Debug, Clone)]
pub struct SdCardLogParser {
    min_len: usize,
    max_len: usize,
    tracker: TimestampTracker,
}

impl Default for SdCardLogParser {
    fn default() -> Self {
        Self::from_config(&ImportConfig::default())
    }
}

impl SdCardLogParser {
    /// Parser probing windows of `min_len..=max_len` bytes.
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self {
            min_len: min_len.max(1),
            max_len,
            tracker: TimestampTracker::new(),
        }
    }

    /// Parser using the import configuration's window.
    pub fn from_config(config: &ImportConfig) -> Self {
        Self::new(config.min_message_len, config.max_message_len)
    }

    /// Forget timestamp state from earlier files.
    pub fn reset(&mut self) {
        self.tracker.reset();
    }

    fn try_window(&self, rest: &[u8]) -> Option<(usize, DeviceMessage)> {
        let longest = self.max_len.min(rest.len());
        (self.min_len..=longest).find_map(|len| {
            decode_exact_frame(&rest[..len])
                .filter(DeviceMessage::has_timestamp)
                .map(|msg| (len, msg))
        })
    }

    /// Parse `content` recorded by device `serial`.
    ///
    /// The first message is stamped `start`; later ones follow the tick counter.
    pub fn parse(
        &mut self,
        content: &[u8],
        serial: &str,
        channels: &mut [ChannelDescriptor],
        start: DateTime<Utc>,
    ) -> ParsedLog {
        let mut parsed = ParsedLog::default();
        let mut offset = 0usize;

        while offset < content.len() {
            match self.try_window(&content[offset..]) {
                Some((len, message)) => {
                    let stamp = self.tracker.observe(serial, message.msg_time_stamp, start);
                    let (samples, _) =
                        process_message(serial, channels, &message, stamp.timestamp, stamp.rollover);
                    parsed.samples.extend(samples);
                    parsed.messages += 1;
                    offset += len;
                }
                None => {
                    parsed.skipped_bytes += 1;
                    offset += 1;
                }
            }
        }

        if parsed.skipped_bytes > 0 {
            debug!(serial, skipped = parsed.skipped_bytes, "Skipped unparseable bytes");
        }
        info!(
            serial,
            bytes = content.len(),
            messages = parsed.messages,
            samples = parsed.samples.len(),
            "Parsed SD-card log"
        );
        parsed
    }
}
