//! Payload codecs and the frame decoder.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameFlags};
use crate::message::Message;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

/// Serializes messages into frame payloads.
///
/// Implementations must round-trip: `decode(encode(m)) == m` for every message.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Short name, exchanged in logs.
    fn name(&self) -> &'static str;

    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError>;

    fn decode(&self, payload: &[u8]) -> Result<Message, ProtocolError>;

    /// Encodes a message into a complete frame.
    fn encode_frame(&self, message: &Message, flags: FrameFlags) -> Result<BytesMut, ProtocolError> {
        Frame::new(self.encode(message)?).with_flags(flags).encode()
    }
}

/// JSON payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<Message, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Accumulates bytes read from a connection and yields complete messages.
pub struct FrameDecoder {
    buffer: BytesMut,
    codec: Arc<dyn Codec>,
}

impl FrameDecoder {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            codec,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message, with the flags of its frame.
    pub fn decode_message(&mut self) -> Result<Option<(FrameFlags, Message)>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some((frame.flags, self.codec.decode(&frame.payload)?))),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Arc::new(JsonCodec))
    }
}
