//! Router error types.

use csmr_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors returned by router operations.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid subscription pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("inbox of {instance} is full ({capacity} undelivered events)")]
    InboxFull { instance: String, capacity: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("router shutting down")]
    ShuttingDown,
}

impl RouterError {
    /// Returns the error code for this error.
    pub fn error_code(&self) -> &'static str {
        self.wire_code().as_str()
    }

    /// Maps the error onto the code carried in a negative acknowledgement.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            RouterError::InvalidPattern { .. } => ErrorCode::BadRequest,
            RouterError::UnknownInstance(_) => ErrorCode::UnknownInstance,
            RouterError::InboxFull { .. } => ErrorCode::InboxFull,
            RouterError::Io(_) => ErrorCode::InternalError,
            RouterError::Protocol(_) => ErrorCode::BadRequest,
            RouterError::ShuttingDown => ErrorCode::Unavailable,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.wire_code().is_retryable()
    }
}

/// Why a single delivery attempt to an endpoint failed.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The endpoint cannot take the event right now.
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// No acknowledgement arrived in time.
    #[error("delivery timed out")]
    Timeout,

    /// The receiving side refused the event.
    #[error("rejected with {code}: {message}")]
    Rejected { code: ErrorCode, message: String },
}

impl DeliveryError {
    pub fn error_code(&self) -> &'static str {
        match self {
            DeliveryError::Unavailable(_) => "UNAVAILABLE",
            DeliveryError::Timeout => "TIMEOUT",
            DeliveryError::Rejected { code, .. } => code.as_str(),
        }
    }

    /// Returns whether the delivery should be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Unavailable(_) | DeliveryError::Timeout => true,
            DeliveryError::Rejected { code, .. } => code.is_retryable(),
        }
    }
}

impl From<ProtocolError> for DeliveryError {
    fn from(err: ProtocolError) -> Self {
        DeliveryError::Unavailable(err.to_string())
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        DeliveryError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_error_codes() {
        let err = RouterError::InboxFull {
            instance: "B".into(),
            capacity: 4,
        };
        assert_eq!(err.error_code(), "INBOX_FULL");
        assert!(err.is_retryable());

        let err = RouterError::UnknownInstance("X".into());
        assert_eq!(err.error_code(), "UNKNOWN_INSTANCE");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_delivery_error_retryable() {
        assert!(DeliveryError::Timeout.is_retryable());
        assert!(DeliveryError::Unavailable("closed".into()).is_retryable());
        assert!(DeliveryError::Rejected {
            code: ErrorCode::InboxFull,
            message: "full".into()
        }
        .is_retryable());
        assert!(!DeliveryError::Rejected {
            code: ErrorCode::UnknownInstance,
            message: "no such instance".into()
        }
        .is_retryable());
    }
}
