//! Error types for the CoreMQ broker.
//!
//! Library code returns [`CoreMqError`] rather than panicking on malformed
//! remote input; the binary entry point wraps these with `anyhow::Context`
//! for human-readable startup diagnostics.

use thiserror::Error;

/// Errors produced by the wire codec, dispatcher, and broker core.
#[derive(Debug, Error)]
pub enum CoreMqError {
    /// The peer closed the connection mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame violated the wire format (bad leading byte, missing space,
    /// unparseable length, or oversized length header).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A command's arguments were malformed (bad queue name, oversized
    /// message, wrong argument shape) but the frame itself parsed fine.
    #[error("value error: {0}")]
    Value(String),

    /// Underlying I/O failure (accept, read, write).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Payload was not valid JSON, or was valid JSON that was not an object.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreMqError {
    /// `true` if this error means the connection must be closed (protocol
    /// violations and closed sockets), as opposed to a recoverable
    /// command-argument error that only yields an `ERROR:` response.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Protocol(_) | Self::Io(_))
    }
}
