//! Messages exchanged between routers.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event as it travels between instances.
///
/// Serialized as `{name, payload, sourceInstanceId, sequenceNumber}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    pub source_instance_id: String,
    /// Strictly increasing per source instance.
    pub sequence_number: u64,
}

impl WireEvent {
    pub fn new(name: impl Into<String>, source_instance_id: impl Into<String>, sequence_number: u64) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            source_instance_id: source_instance_id.into(),
            sequence_number,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Who a published event is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetScope {
    /// Every subscriber whose pattern matches, except the source.
    Subscribers,
    /// Every subscriber whose pattern matches, the source included.
    Everyone,
    /// One instance, regardless of subscriptions.
    Instance { id: String },
}

impl TargetScope {
    pub fn instance(id: impl Into<String>) -> Self {
        TargetScope::Instance { id: id.into() }
    }
}

/// Router-to-router message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// First message on a connection, in both directions.
    Hello { node_id: String, version: u16 },

    /// An event to publish on the receiving router.
    Publish {
        inbox_sequence: u64,
        scope: TargetScope,
        event: WireEvent,
    },

    /// The publish with this inbox sequence was accepted.
    Ack { inbox_sequence: u64 },

    /// The publish with this inbox sequence was refused.
    Nack {
        inbox_sequence: u64,
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    pub fn hello(node_id: impl Into<String>) -> Self {
        Message::Hello {
            node_id: node_id.into(),
            version: crate::PROTOCOL_VERSION,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Publish { .. } => "publish",
            Message::Ack { .. } => "ack",
            Message::Nack { .. } => "nack",
        }
    }
}
