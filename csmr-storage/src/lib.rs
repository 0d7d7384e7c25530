//! # csmr-storage
//!
//! Storage layer for csmr.
//!
//! This crate provides:
//! - Durable checkpoint storage with CRC32C verification
//! - Atomic writes (temp file, fsync, rename)
//! - Retention of the most recent checkpoints per instance

pub mod checkpoint;
pub mod error;

pub use checkpoint::{CheckpointMeta, CheckpointStore, DEFAULT_RETAIN};
pub use error::StorageError;
