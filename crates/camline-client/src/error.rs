//! Client error types.

use thiserror::Error;

use camline_protocol::ProtocolError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Server directory lookup failed or returned no candidates.
    #[error("server directory error: {0}")]
    Directory(String),

    /// Socket could not be established.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected the login handshake. Not retried automatically.
    #[error("login rejected with status {status}")]
    Login { status: i32 },

    /// The connection was torn down while an operation was outstanding.
    #[error("disconnected before the operation completed")]
    Disconnected,

    /// An operation that requires a live connection was called without one.
    #[error("not connected")]
    NotConnected,

    /// Out-of-band ext-data fetch failed.
    #[error("ext-data fetch failed: {0}")]
    ExtData(String),

    /// Unrecoverable framing error on the byte stream.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error (socket read/write).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Creates a directory error.
    pub fn directory(message: impl Into<String>) -> Self {
        Self::Directory(message.into())
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }
}
