use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace};

use crate::error::{FrameError, Result};
use crate::message::ConduitMessage;
use crate::mutf8;

/// Frame marker. No byte value repeats, so a scanner that loses its place
/// can always tell a fresh start from a continuation.
pub const MARKER: [u8; 8] = [0x01, 0x7F, b'C', b'n', b'd', b'u', b'i', b't'];

/// Longest encoded string a 2-byte length prefix can describe.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────────┬───────────────┬───────────────┐
/// │ Marker (8B)  │ User          │ Id            │ Payload       │
/// │ 01 7F Cnduit │ u16 BE + MUTF8│ u16 BE + MUTF8│ u16 BE + MUTF8│
/// └──────────────┴───────────────┴───────────────┴───────────────┘
/// ```
///
/// Nothing is written to `dst` if any field is too long.
pub fn encode_message(message: &ConduitMessage, dst: &mut BytesMut) -> Result<()> {
    let user = encode_field("user", message.user())?;
    let id = encode_field("id", message.id())?;
    let payload = encode_field("payload", message.payload())?;

    dst.reserve(MARKER.len() + 6 + user.len() + id.len() + payload.len());
    dst.put_slice(&MARKER);
    for field in [&user, &id, &payload] {
        dst.put_u16(field.len() as u16);
        dst.put_slice(field);
    }
    Ok(())
}

fn encode_field(field: &'static str, value: &str) -> Result<Vec<u8>> {
    let bytes = mutf8::encode(value);
    if bytes.len() > MAX_STRING_LEN {
        return Err(FrameError::StringTooLong {
            field,
            len: bytes.len(),
            max: MAX_STRING_LEN,
        });
    }
    Ok(bytes)
}

/// Incremental, resynchronizing message decoder.
///
/// Bytes that are not part of a frame are consumed and dropped while the
/// decoder hunts for [`MARKER`]. Partial marker matches survive across calls,
/// so the marker may straddle reads.
#[derive(Debug, Default, Clone)]
pub struct MessageDecoder {
    matched: usize,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one message from `src`.
    ///
    /// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
    /// On success, consumes everything up to and including the message.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ConduitMessage>> {
        if self.matched < MARKER.len() {
            let resumed = self.matched;
            let mut consumed = 0;
            for &byte in src.iter() {
                consumed += 1;
                self.matched = advance_match(self.matched, byte);
                if self.matched == MARKER.len() {
                    break;
                }
            }
            src.advance(consumed);
            if self.matched < MARKER.len() {
                return Ok(None);
            }
            let discarded = (resumed + consumed).saturating_sub(MARKER.len());
            if discarded > 0 {
                trace!(discarded, "skipped bytes before frame marker");
            }
        }

        let mut pos = 0;
        let fields = match parse_fields(&src[..], &mut pos) {
            Ok(Some(fields)) => fields,
            Ok(None) => return Ok(None), // Need more data
            Err(err) => {
                debug!(error = %err, "malformed frame; rescanning for marker");
                self.matched = 0;
                return Err(err);
            }
        };

        src.advance(pos);
        self.matched = 0;
        let [user, id, payload] = fields;
        Ok(Some(ConduitMessage::from_parts(user, id, payload)))
    }

    /// True while part or all of a marker has been seen but no message emitted.
    pub fn is_mid_frame(&self) -> bool {
        self.matched > 0
    }
}

fn advance_match(matched: usize, byte: u8) -> usize {
    if byte == MARKER[matched] {
        matched + 1
    } else if byte == MARKER[0] {
        // A false start may hide the beginning of the real marker.
        1
    } else {
        0
    }
}

fn parse_fields(buf: &[u8], pos: &mut usize) -> Result<Option<[String; 3]>> {
    let Some(user) = take_string(buf, pos, "user")? else {
        return Ok(None);
    };
    let Some(id) = take_string(buf, pos, "id")? else {
        return Ok(None);
    };
    let Some(payload) = take_string(buf, pos, "payload")? else {
        return Ok(None);
    };
    Ok(Some([user, id, payload]))
}

fn take_string(buf: &[u8], pos: &mut usize, field: &'static str) -> Result<Option<String>> {
    if buf.len() < *pos + 2 {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]) as usize;
    let start = *pos + 2;
    if buf.len() < start + len {
        return Ok(None);
    }
    let value =
        mutf8::decode(&buf[start..start + len]).ok_or(FrameError::InvalidString { field })?;
    // Lenient input (4-byte UTF-8) can grow when re-encoded; such a field
    // could never be relayed.
    if mutf8::encoded_len(&value) > MAX_STRING_LEN {
        return Err(FrameError::InvalidString { field });
    }
    *pos = start + len;
    Ok(Some(value))
}

/// Configuration for message writers.
#[derive(Debug, Clone, Default)]
pub struct FrameConfig {
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(msg: &ConduitMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_message(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn marker_has_no_repeated_bytes() {
        for (i, a) in MARKER.iter().enumerate() {
            for b in &MARKER[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_encode_layout() {
        let msg = ConduitMessage::from_parts("ann", "open", "x");
        let buf = wire(&msg);

        assert_eq!(&buf[..8], &MARKER);
        assert_eq!(&buf[8..10], &[0, 3]);
        assert_eq!(&buf[10..13], b"ann");
        assert_eq!(&buf[13..15], &[0, 4]);
        assert_eq!(&buf[15..19], b"open");
        assert_eq!(&buf[19..21], &[0, 1]);
        assert_eq!(&buf[21..], b"x");
        assert_eq!(buf.len(), msg.wire_size());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = ConduitMessage::from_parts("bob", "sheet", "hello, conduit!");
        let mut buf = wire(&msg);

        let decoded = MessageDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_unusual_payloads() {
        let marker_text = std::str::from_utf8(&MARKER).unwrap();
        let payloads = [
            String::new(),
            "Grüße 世界 😀".to_string(),
            "nul\0inside".to_string(),
            marker_text.to_string(),
            format!("{marker_text}{marker_text}tail"),
        ];

        for payload in payloads {
            let msg = ConduitMessage::from_parts("u", marker_text, payload.as_str());
            let mut buf = wire(&msg);
            let decoded = MessageDecoder::new().decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.payload(), payload);
            assert_eq!(decoded.id(), marker_text);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_marker_in_payload_does_not_split_stream() {
        let marker_text = std::str::from_utf8(&MARKER).unwrap();
        let first = ConduitMessage::from_parts("u", "a", marker_text);
        let second = ConduitMessage::from_parts("u", "b", "after");

        let mut buf = wire(&first);
        buf.extend_from_slice(&wire(&second));

        let mut decoder = MessageDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), second);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_skips_leading_noise() {
        let msg = ConduitMessage::from_parts("u", "id", "body");
        let mut buf = BytesMut::from(&b"garbage\x01\x7fC-more"[..]);
        buf.extend_from_slice(&wire(&msg));

        let decoded = MessageDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_overlapping_false_start() {
        // M1 M2 M1 M2 M3 .. M8: the real marker begins at the second M1.
        let msg = ConduitMessage::from_parts("u", "id", "body");
        let mut buf = BytesMut::from(&MARKER[..2]);
        buf.extend_from_slice(&wire(&msg));

        let decoded = MessageDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_marker_then_unrelated_byte_resets() {
        let mut buf = BytesMut::from(&MARKER[..5]);
        buf.put_u8(b'z');
        buf.extend_from_slice(&MARKER[1..]);

        let mut decoder = MessageDecoder::new();
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(!decoder.is_mid_frame());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_marker_split_across_calls() {
        let msg = ConduitMessage::from_parts("u", "id", "split");
        let full = wire(&msg);

        let mut decoder = MessageDecoder::new();
        let mut buf = BytesMut::from(&full[..3]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.is_mid_frame());

        buf.extend_from_slice(&full[3..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_decode_incomplete_fields() {
        let msg = ConduitMessage::from_parts("user", "id", "payload");
        let full = wire(&msg);

        let mut decoder = MessageDecoder::new();
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 2..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_decode_malformed_string() {
        let mut buf = BytesMut::from(&MARKER[..]);
        buf.put_u16(1);
        buf.put_u8(0xFF);
        buf.put_u16(0);
        buf.put_u16(0);

        let mut decoder = MessageDecoder::new();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidString { field: "user" }));
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn test_decode_rejects_field_that_grows_on_reencode() {
        // Standard 4-byte UTF-8 is accepted, but each char re-encodes to 6 bytes.
        let payload = "\u{1F600}".repeat(16_000);
        assert_eq!(payload.len(), 64_000);

        let mut buf = BytesMut::from(&MARKER[..]);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload.as_bytes());

        let err = MessageDecoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidString { field: "payload" }));
    }

    #[test]
    fn test_decode_accepts_short_four_byte_field() {
        let mut buf = BytesMut::from(&MARKER[..]);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(4);
        buf.put_slice("\u{1F600}".as_bytes());

        let decoded = MessageDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload(), "\u{1F600}");
    }

    #[test]
    fn test_encode_rejects_oversized_field() {
        let msg = ConduitMessage::from_parts("u", "id", "x".repeat(MAX_STRING_LEN + 1));
        let mut buf = BytesMut::new();
        let err = encode_message(&msg, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::StringTooLong {
                field: "payload",
                ..
            }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_max_length_field_fits() {
        let msg = ConduitMessage::from_parts("u", "id", "x".repeat(MAX_STRING_LEN));
        let mut buf = wire(&msg);
        let decoded = MessageDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload().len(), MAX_STRING_LEN);
    }
}
