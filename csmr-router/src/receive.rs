//! Receiving side: duplicate suppression and conversion to interpreter events.

use crate::endpoint::Delivery;
use csmr_core::{Channel, Event, Watermarks};
use csmr_protocol::{TargetScope, WireEvent};

/// Drops deliveries already seen from the same source.
///
/// Keeps the highest sequence number admitted per source instance. Retries
/// and checkpoint redelivery can hand the same event over more than once;
/// only the first copy gets through, and never behind a later one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deduplicator {
    watermarks: Watermarks,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the watermarks stored in a checkpoint.
    pub fn from_watermarks(watermarks: Watermarks) -> Self {
        Self { watermarks }
    }

    /// Returns true if the event is new and records it.
    pub fn admit(&mut self, event: &WireEvent) -> bool {
        let mark = self
            .watermarks
            .entry(event.source_instance_id.clone())
            .or_insert(0);
        if event.sequence_number <= *mark {
            return false;
        }
        *mark = event.sequence_number;
        true
    }

    pub fn watermark(&self, source: &str) -> u64 {
        self.watermarks.get(source).copied().unwrap_or(0)
    }

    pub fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }
}

/// Converts a wire event into an interpreter event.
pub fn to_core_event(event: WireEvent, channel: Channel) -> Event {
    Event::new(event.name, channel)
        .with_payload(event.payload)
        .with_source(event.source_instance_id, event.sequence_number)
}

/// Builds the wire form of an event published by `source`.
pub fn to_wire_event(event: &Event, source: &str, sequence_number: u64) -> WireEvent {
    WireEvent::new(event.name.clone(), source, sequence_number).with_payload(event.payload.clone())
}

/// Scope an interpreter event is published with.
pub fn scope_for(channel: Channel) -> Option<TargetScope> {
    match channel {
        Channel::Internal => None,
        Channel::External => Some(TargetScope::Subscribers),
        Channel::Global => Some(TargetScope::Everyone),
    }
}

impl Delivery {
    /// The interpreter event carried by this delivery.
    pub fn into_event(self) -> Event {
        let channel = match self.scope {
            TargetScope::Everyone => Channel::Global,
            TargetScope::Subscribers | TargetScope::Instance { .. } => Channel::External,
        };
        to_core_event(self.event, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedupe_per_source() {
        let mut dedupe = Deduplicator::new();
        assert!(dedupe.admit(&WireEvent::new("ping", "A", 1)));
        assert!(dedupe.admit(&WireEvent::new("ping", "A", 2)));
        assert!(!dedupe.admit(&WireEvent::new("ping", "A", 2)));
        assert!(!dedupe.admit(&WireEvent::new("ping", "A", 1)));
        assert!(dedupe.admit(&WireEvent::new("ping", "B", 1)));

        assert_eq!(dedupe.watermark("A"), 2);
        assert_eq!(dedupe.watermark("C"), 0);
    }

    #[test]
    fn test_dedupe_resumes_from_watermarks() {
        let mut marks = Watermarks::new();
        marks.insert("A".into(), 5);
        let mut dedupe = Deduplicator::from_watermarks(marks);
        assert!(!dedupe.admit(&WireEvent::new("ping", "A", 5)));
        assert!(dedupe.admit(&WireEvent::new("ping", "A", 6)));
        assert_eq!(dedupe.watermarks().get("A"), Some(&6));
    }

    #[test]
    fn test_delivery_into_event() {
        let delivery = Delivery {
            inbox_sequence: 3,
            scope: TargetScope::Everyone,
            event: WireEvent::new("tick", "A", 9).with_payload(json!({"n": 1})),
        };
        let event = delivery.into_event();
        assert_eq!(event.name, "tick");
        assert_eq!(event.channel, Channel::Global);
        assert_eq!(event.source.as_deref(), Some("A"));
        assert_eq!(event.sequence_number, Some(9));
        assert_eq!(event.payload, json!({"n": 1}));
    }

    #[test]
    fn test_wire_conversion() {
        let event = Event::external("job.done").with_payload(json!([1, 2]));
        let wire = to_wire_event(&event, "A", 4);
        assert_eq!(wire.source_instance_id, "A");
        assert_eq!(wire.sequence_number, 4);
        assert_eq!(wire.payload, json!([1, 2]));

        assert_eq!(scope_for(Channel::Internal), None);
        assert_eq!(scope_for(Channel::External), Some(TargetScope::Subscribers));
        assert_eq!(scope_for(Channel::Global), Some(TargetScope::Everyone));
    }
}
