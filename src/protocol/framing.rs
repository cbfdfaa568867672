//! Varint length-delimited framing for [`DeviceMessage`].
//!
//! The live stream is split with a [`tokio_util::codec::Decoder`]. SD-card logs
//! cannot trust their prefixes (partial writes, garbage between records), so the
//! log parser tries candidate windows with [`decode_exact_frame`] instead.

use super::DeviceMessage;
use bytes::{Buf, BytesMut};
use prost::Message;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

/// Largest frame accepted from a live stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Longest protobuf varint (10 bytes for a u64).
const MAX_VARINT_LEN: usize = 10;

/// Output of [`DeviceMessageCodec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete, decodable message
    Message(DeviceMessage),
    /// A complete frame whose body did not decode; it has been dropped
    Malformed(String),
}

enum Varint {
    Complete { value: u64, len: usize },
    Incomplete,
    Invalid,
}

/// Like `prost::decode_length_delimiter`, but tells a truncated prefix from an
/// invalid one.
fn peek_varint(buf: &[u8]) -> Varint {
    let mut value = 0u64;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Varint::Complete { value, len: i + 1 };
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Varint::Invalid
    } else {
        Varint::Incomplete
    }
}

/// Splits a byte stream into device messages.
///
/// Framing errors never fail the stream: an implausible length prefix costs one
/// byte (the decoder resynchronizes on the next offset), and an undecodable body
/// is reported as [`Decoded::Malformed`] and skipped.
#[derive(Debug, Clone)]
pub struct DeviceMessageCodec {
    max_frame_len: usize,
}

impl Default for DeviceMessageCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl DeviceMessageCodec {
    /// Codec that rejects frames longer than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Decoder for DeviceMessageCodec {
    type Item = Decoded;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut skipped = 0usize;
        loop {
            let (len, prefix) = match peek_varint(src) {
                Varint::Incomplete => return Ok(None),
                Varint::Complete { value, len } if value as usize <= self.max_frame_len => {
                    (value as usize, len)
                }
                _ => {
                    src.advance(1);
                    skipped += 1;
                    continue;
                }
            };

            if skipped > 0 {
                debug!(skipped, "Resynchronized device stream");
            }

            if src.len() < prefix + len {
                src.reserve(prefix + len - src.len());
                return Ok(None);
            }

            src.advance(prefix);
            let body = src.split_to(len);
            return Ok(Some(match DeviceMessage::decode(body.freeze()) {
                Ok(msg) => Decoded::Message(msg),
                Err(e) => Decoded::Malformed(e.to_string()),
            }));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    trace!(remaining = buf.len(), "Discarding partial frame at end of stream");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

/// Encode a message with its varint length prefix.
pub fn encode_frame(message: &DeviceMessage) -> Vec<u8> {
    message.encode_length_delimited_to_vec()
}

/// Decode `window` as exactly one length-prefixed message.
///
/// Returns `None` unless the prefix plus the body it announces covers the whole
/// window and the body decodes.
pub fn decode_exact_frame(window: &[u8]) -> Option<DeviceMessage> {
    let mut body = window;
    let body_len = prost::decode_length_delimiter(&mut body).ok()?;
    if body.len() != body_len {
        return None;
    }
    DeviceMessage::decode(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_message(tick: u32) -> DeviceMessage {
        DeviceMessage {
            msg_time_stamp: tick,
            analog_in_data: vec![100, -200, 300],
            digital_data: vec![0b0000_0101],
            ..Default::default()
        }
    }

    #[test]
    fn codec_splits_concatenated_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&streaming_message(1)));
        buf.extend_from_slice(&encode_frame(&streaming_message(2)));

        let mut codec = DeviceMessageCodec::default();
        let first = codec.decode(&mut buf).unwrap();
        let second = codec.decode(&mut buf).unwrap();
        assert_eq!(first, Some(Decoded::Message(streaming_message(1))));
        assert_eq!(second, Some(Decoded::Message(streaming_message(2))));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn codec_waits_for_partial_frame() {
        let frame = encode_frame(&streaming_message(7));
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut codec = DeviceMessageCodec::default();
        let mut buf = BytesMut::from(head);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(tail);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Message(streaming_message(7)))
        );
    }

    #[test]
    fn codec_skips_oversized_prefix() {
        let mut codec = DeviceMessageCodec::new(16);
        // 0x7f announces a 127-byte frame, which is over the limit
        let mut buf = BytesMut::from(&[0x7fu8][..]);
        buf.extend_from_slice(&encode_frame(&streaming_message(3)));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Message(streaming_message(3)))
        );
    }

    #[test]
    fn codec_reports_undecodable_body() {
        // Length 2, then field 1 declared as a length-delimited type with no length
        let mut buf = BytesMut::from(&[0x02u8, 0x0a, 0xff][..]);
        let mut codec = DeviceMessageCodec::default();
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Malformed(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn exact_frame_rejects_short_and_long_windows() {
        let frame = encode_frame(&streaming_message(42));
        assert_eq!(decode_exact_frame(&frame), Some(streaming_message(42)));
        assert_eq!(decode_exact_frame(&frame[..frame.len() - 1]), None);

        let mut longer = frame.clone();
        longer.push(0);
        assert_eq!(decode_exact_frame(&longer), None);
    }

    #[test]
    fn exact_frame_rejects_unterminated_prefix() {
        assert_eq!(decode_exact_frame(&[0xff; 12]), None);
        assert_eq!(decode_exact_frame(&[]), None);
    }
}
