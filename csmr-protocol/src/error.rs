//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from framing, encoding or the peer connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'CSMF', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Returns true if the connection may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::ConnectionClosed)
    }
}

/// Stable error codes carried in negative acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnsupportedProtocol,
    BadRequest,
    /// The receiving router has no inbox for the instance.
    UnknownInstance,
    /// The instance's inbox is at capacity.
    InboxFull,
    /// The instance is not currently attached.
    Unavailable,
    InternalError,
}

impl ErrorCode {
    /// Returns whether the sender should retry the delivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::InboxFull | ErrorCode::Unavailable | ErrorCode::InternalError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::UnknownInstance => "UNKNOWN_INSTANCE",
            ErrorCode::InboxFull => "INBOX_FULL",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
