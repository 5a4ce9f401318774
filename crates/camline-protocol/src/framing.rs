//! Fixed-envelope framing for the chat byte stream.
//!
//! Frames carry a 28-byte header of seven big-endian i32s followed by the
//! declared number of payload bytes. The decoder is incremental: it reports
//! "not enough bytes yet" instead of erroring on a split read, so the caller
//! can keep appending socket data and retrying.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Message, MessageKind, Payload};
use crate::{HEADER_LEN, MAGIC, MAX_PAYLOAD_SIZE};

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let bytes: [u8; 4] = buf[offset..offset + 4].try_into().expect("4-byte slice");
    i32::from_be_bytes(bytes)
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, or
/// `Ok(Some((message, consumed)))` with the number of bytes the frame
/// occupied. A magic mismatch or an absurd payload length is fatal: the
/// stream cannot be resynchronized and must be dropped.
pub fn decode_frame(buf: &[u8]) -> ProtocolResult<Option<(Message, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let magic = read_i32(buf, 0);
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic {
            expected: MAGIC,
            found: magic,
        });
    }

    let payload_len = read_i32(buf, 24);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    // Non-positive lengths mean "no payload bytes follow".
    let payload_len = payload_len.max(0) as usize;
    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    let payload = if payload_len == 0 {
        Payload::None
    } else {
        let text = String::from_utf8_lossy(&buf[HEADER_LEN..HEADER_LEN + payload_len]);
        Payload::decode(&text)
    };

    let message = Message {
        kind: MessageKind::from_i32(read_i32(buf, 4)),
        from: read_i32(buf, 8),
        to: read_i32(buf, 12),
        arg1: read_i32(buf, 16),
        arg2: read_i32(buf, 20),
        payload,
    };

    Ok(Some((message, HEADER_LEN + payload_len)))
}

/// Encodes one frame.
///
/// `session_id` becomes the envelope's `from` field: the sender's own
/// session id, 0 before login. An empty payload encodes as length 0 with no
/// trailing bytes.
pub fn encode_frame(
    session_id: i32,
    kind: MessageKind,
    to: i32,
    arg1: i32,
    arg2: i32,
    payload: &Payload,
) -> ProtocolResult<Vec<u8>> {
    let text = payload.encode();
    if text.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(ProtocolError::PayloadTooLarge {
            size: text.len() as i32,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + text.len());
    for field in [
        MAGIC,
        kind.as_i32(),
        session_id,
        to,
        arg1,
        arg2,
        text.len() as i32,
    ] {
        buf.extend_from_slice(&field.to_be_bytes());
    }
    buf.extend_from_slice(text.as_bytes());
    Ok(buf)
}

/// Accumulating frame decoder for the read loop.
///
/// Feed raw socket bytes with [`FrameBuffer::extend`], then drain complete
/// messages with [`FrameBuffer::next_message`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decodes and removes the next complete frame, if one is buffered.
    pub fn next_message(&mut self) -> ProtocolResult<Option<Message>> {
        match decode_frame(&self.buf)? {
            Some((message, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Number of buffered, not-yet-decoded bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(kind: MessageKind, payload: &Payload) -> Vec<u8> {
        encode_frame(7, kind, 11, 13, 17, payload).unwrap()
    }

    #[test]
    fn roundtrip_with_json_payload() {
        let payload = Payload::Json(json!({"uid": 42, "vs": 0}));
        let bytes = frame(MessageKind::Details, &payload);

        let (message, consumed) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(message.kind, MessageKind::Details);
        assert_eq!(message.from, 7);
        assert_eq!(message.to, 11);
        assert_eq!(message.arg1, 13);
        assert_eq!(message.arg2, 17);
        assert_eq!(message.payload, payload);
    }

    #[test]
    fn roundtrip_zero_payload() {
        let bytes = frame(MessageKind::Null, &Payload::None);
        assert_eq!(bytes.len(), HEADER_LEN);

        let (message, consumed) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, HEADER_LEN);
        assert!(message.payload.is_none());
    }

    #[test]
    fn incomplete_header_and_payload() {
        let bytes = frame(MessageKind::Cmesg, &Payload::Text("hello".into()));

        // Header split mid-field.
        assert!(decode_frame(&bytes[..10]).unwrap().is_none());
        // Full header, short payload.
        assert!(decode_frame(&bytes[..HEADER_LEN + 2]).unwrap().is_none());
        // Everything.
        assert!(decode_frame(&bytes).unwrap().is_some());
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut bytes = frame(MessageKind::Null, &Payload::None);
        bytes[0] ^= 0xff;
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn absurd_payload_length_is_fatal() {
        let mut bytes = frame(MessageKind::Null, &Payload::None);
        bytes[24..28].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_json_payload_falls_back_to_text() {
        let bytes = frame(MessageKind::Tags, &Payload::Text(r#"{"123":["tag"#.into()));
        let (message, _) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(message.payload.as_text(), Some(r#"{"123":["tag"#));
    }

    #[test]
    fn byte_by_byte_equals_whole_buffer() {
        let messages = [
            frame(MessageKind::Login, &Payload::Text("alice".into())),
            frame(MessageKind::Details, &Payload::Json(json!({"uid": 1}))),
            frame(MessageKind::Null, &Payload::None),
        ];
        let stream: Vec<u8> = messages.concat();

        // Whole buffer in one call.
        let mut whole = FrameBuffer::new();
        whole.extend(&stream);
        let mut all_at_once = Vec::new();
        while let Some(msg) = whole.next_message().unwrap() {
            all_at_once.push(msg);
        }

        // One byte at a time.
        let mut trickle = FrameBuffer::new();
        let mut one_by_one = Vec::new();
        for byte in &stream {
            trickle.extend(std::slice::from_ref(byte));
            while let Some(msg) = trickle.next_message().unwrap() {
                one_by_one.push(msg);
            }
        }

        assert_eq!(all_at_once.len(), 3);
        assert_eq!(all_at_once, one_by_one);
        assert!(whole.is_empty());
        assert!(trickle.is_empty());
    }
}
