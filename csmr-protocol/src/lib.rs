//! # csmr-protocol
//!
//! Wire protocol spoken between csmr event routers.
//!
//! This crate provides:
//! - The event envelope (`WireEvent`) and router messages
//! - A pluggable payload `Codec` with a JSON implementation
//! - Binary framing with length prefix and CRC32C validation
//! - Error codes carried in negative acknowledgements

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Codec, FrameDecoder, JsonCodec};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Message, TargetScope, WireEvent};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port of the router listener.
pub const DEFAULT_PORT: u16 = 7411;

/// Maximum frame payload size (4 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;
