//! Coordination error types.

use thiserror::Error;

/// Errors from the coordination layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("session {0} expired")]
    SessionExpired(u64),

    #[error("session {0} closed")]
    SessionClosed(u64),

    #[error("instance {instance} is registered by node {node}")]
    AlreadyRegistered { instance: String, node: String },

    #[error("instance {0} is not registered by this session")]
    NotOwner(String),

    #[error("lease on {resource} lost")]
    LeaseLost { resource: String },

    #[error("coordination backend error: {0}")]
    Backend(String),
}

impl CoordinationError {
    /// Returns the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinationError::SessionExpired(_) => "SESSION_EXPIRED",
            CoordinationError::SessionClosed(_) => "SESSION_CLOSED",
            CoordinationError::AlreadyRegistered { .. } => "ALREADY_REGISTERED",
            CoordinationError::NotOwner(_) => "NOT_OWNER",
            CoordinationError::LeaseLost { .. } => "LEASE_LOST",
            CoordinationError::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Returns whether this error is retryable.
    ///
    /// A lost session is not: the caller must open a new one.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::AlreadyRegistered { .. } | CoordinationError::Backend(_)
        )
    }
}
