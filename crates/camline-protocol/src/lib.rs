//! Wire protocol for the chat servers of a live-video platform.
//!
//! The protocol is a raw TCP byte stream carrying fixed-envelope frames:
//!
//! ```text
//! +-------+------+------+----+------+------+-------------+-----------+
//! | magic | kind | from | to | arg1 | arg2 | payload_len | payload.. |
//! +-------+------+------+----+------+------+-------------+-----------+
//!   7 x i32, big-endian                       payload_len bytes, UTF-8
//! ```
//!
//! Payloads are UTF-8 text, JSON-decoded when syntactically valid and kept
//! verbatim otherwise (the server truncates oversized structured payloads,
//! producing invalid JSON that must not abort decoding).
//!
//! # Example
//!
//! ```rust
//! use camline_protocol::{FrameBuffer, MessageKind, Payload, encode_frame};
//!
//! let bytes = encode_frame(0, MessageKind::Null, 0, 0, 0, &Payload::None).unwrap();
//! let mut frames = FrameBuffer::new();
//! frames.extend(&bytes);
//! let msg = frames.next_message().unwrap().unwrap();
//! assert_eq!(msg.kind, MessageKind::Null);
//! ```

mod constants;
mod error;
mod framing;
mod list;
mod message;

pub use constants::{
    CHAT_PORT, ChannelOption, LOGIN_VERSION, ListType, UserLevel, VideoState, WOPT_REDIS_JSON,
};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameBuffer, decode_frame, encode_frame};
pub use list::expand_rows;
pub use message::{Message, MessageKind, Payload};

/// Fixed constant identifying the protocol version; the first field of every
/// frame on the wire.
pub const MAGIC: i32 = -2027771214;

/// Envelope size: seven big-endian 32-bit signed integers.
pub const HEADER_LEN: usize = 28;

/// Upper bound on a frame's declared payload length (4 MB). A larger value
/// means the stream is corrupt, not that a bigger payload is coming.
pub const MAX_PAYLOAD_SIZE: i32 = 4 * 1024 * 1024;
