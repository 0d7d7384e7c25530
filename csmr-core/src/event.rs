//! Events exchanged by state machine instances.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery channel of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Raised and consumed within one instance, ahead of any queued external event.
    #[default]
    Internal,
    /// Published to the subscribers of other instances.
    External,
    /// Published to every subscribed instance, the publisher included.
    Global,
}

/// A named message with an optional payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,

    #[serde(default)]
    pub channel: Channel,

    #[serde(default)]
    pub payload: Value,

    /// Publishing instance, if the event came through the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Per-source sequence number assigned on publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

impl Event {
    pub fn new(name: impl Into<String>, channel: Channel) -> Self {
        Self {
            name: name.into(),
            channel,
            payload: Value::Null,
            source: None,
            sequence_number: None,
        }
    }

    pub fn internal(name: impl Into<String>) -> Self {
        Self::new(name, Channel::Internal)
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self::new(name, Channel::External)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>, sequence_number: u64) -> Self {
        self.source = Some(source.into());
        self.sequence_number = Some(sequence_number);
        self
    }

    /// Returns true if the event leaves the instance that raised it.
    pub fn is_published(&self) -> bool {
        self.channel != Channel::Internal
    }
}

/// Name of the event raised when a composite or parallel state completes.
pub fn done_state_event(state_path: &str) -> String {
    format!("done.state.{}", state_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_serde() {
        assert_eq!(serde_json::to_value(Channel::Global).unwrap(), json!("global"));
        let c: Channel = serde_json::from_value(json!("external")).unwrap();
        assert_eq!(c, Channel::External);
    }

    #[test]
    fn test_event_defaults() {
        let e: Event = serde_json::from_value(json!({"name": "ping"})).unwrap();
        assert_eq!(e.channel, Channel::Internal);
        assert_eq!(e.payload, Value::Null);
        assert!(!e.is_published());
        assert!(Event::external("ping").is_published());
    }
}
