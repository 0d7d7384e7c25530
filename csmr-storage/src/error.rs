//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}

impl StorageError {
    /// Returns the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "STORAGE_IO_ERROR",
            StorageError::Json(_) => "STORAGE_FORMAT_ERROR",
            StorageError::CheckpointNotFound(_) => "CHECKPOINT_NOT_FOUND",
            StorageError::Corruption(_) => "CHECKPOINT_CORRUPTED",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}
