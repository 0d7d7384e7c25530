//! Runtime error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core error: {0}")]
    Core(#[from] csmr_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] csmr_storage::StorageError),

    #[error("coordination error: {0}")]
    Coordination(#[from] csmr_coord::CoordinationError),

    #[error("router error: {0}")]
    Router(#[from] csmr_router::RouterError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("instance '{0}' is already hosted on this node")]
    DuplicateInstance(String),

    #[error("runtime shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Io(_) => "IO_ERROR",
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Storage(e) => e.error_code(),
            RuntimeError::Coordination(e) => e.error_code(),
            RuntimeError::Router(e) => e.error_code(),
            RuntimeError::Config(_) => "CONFIG_ERROR",
            RuntimeError::Metrics(_) => "METRICS_ERROR",
            RuntimeError::DuplicateInstance(_) => "INSTANCE_EXISTS",
            RuntimeError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Io(_) => true,
            RuntimeError::Storage(e) => e.is_retryable(),
            RuntimeError::Coordination(e) => e.is_retryable(),
            RuntimeError::Router(e) => e.is_retryable(),
            _ => false,
        }
    }
}
