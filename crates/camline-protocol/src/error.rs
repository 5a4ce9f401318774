//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing or deframing the byte stream.
///
/// A malformed JSON payload is deliberately *not* an error: the decoder
/// falls back to keeping the raw text, since the server is known to
/// truncate oversized payloads mid-document.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The magic constant did not match. The stream cannot be resynchronized
    /// past this point; the connection has to be dropped.
    #[error("bad magic: expected {expected}, found {found}")]
    BadMagic { expected: i32, found: i32 },

    /// A frame declared a payload length beyond the protocol maximum.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: i32, max: i32 },

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
