//! Checkpoint record of one instance.

use crate::interpreter::{InvocationRequest, Status};
use crate::value::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-source high-water marks of processed sequence numbers.
pub type Watermarks = BTreeMap<String, u64>;

/// Everything needed to resume an instance after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub instance_id: String,

    /// `Model::model_version()` of the model the instance ran.
    pub model_version: String,

    /// Active state paths in document order.
    pub configuration: Vec<String>,

    pub context: Context,

    /// Inbox sequence number of the last event processed. Delivery resumes after it.
    #[serde(default)]
    pub last_processed_sequence_number: u64,

    /// Highest processed sequence number per publishing instance.
    #[serde(default)]
    pub source_watermarks: Watermarks,

    /// Last sequence number this instance assigned to a published event.
    #[serde(default)]
    pub last_published_sequence_number: u64,

    /// Number of service invocations issued so far.
    #[serde(default)]
    pub invocations: u64,

    /// Invocations issued but not yet answered when the checkpoint was taken.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_invocations: Vec<InvocationRequest>,

    pub status: Status,

    /// Unix millis.
    pub taken_at: i64,
}

impl Checkpoint {
    pub fn new(
        instance_id: impl Into<String>,
        model_version: impl Into<String>,
        configuration: Vec<String>,
        context: Context,
        status: Status,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            model_version: model_version.into(),
            configuration,
            context,
            last_processed_sequence_number: 0,
            source_watermarks: Watermarks::new(),
            last_published_sequence_number: 0,
            invocations: 0,
            pending_invocations: Vec::new(),
            status,
            taken_at: now_millis(),
        }
    }

    /// Records router delivery progress.
    pub fn with_delivery(
        mut self,
        last_processed: u64,
        watermarks: Watermarks,
        last_published: u64,
    ) -> Self {
        self.last_processed_sequence_number = last_processed;
        self.source_watermarks = watermarks;
        self.last_published_sequence_number = last_published;
        self
    }

    pub fn with_invocations(mut self, invocations: u64) -> Self {
        self.invocations = invocations;
        self
    }

    pub fn with_pending_invocations(mut self, pending: Vec<InvocationRequest>) -> Self {
        self.pending_invocations = pending;
        self
    }

    /// Returns true if an event from `source` with `sequence_number` was already processed.
    pub fn has_processed(&self, source: &str, sequence_number: u64) -> bool {
        self.source_watermarks
            .get(source)
            .is_some_and(|&mark| sequence_number <= mark)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_json_shape() {
        let context: Context = [("count".to_string(), json!(3))].into_iter().collect();
        let mut marks = Watermarks::new();
        marks.insert("pinger".to_string(), 7);
        let checkpoint = Checkpoint::new("i-1", "1-abcdef0123456789", vec!["Running".into()], context, Status::Idle)
            .with_delivery(12, marks, 4);

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["instanceId"], "i-1");
        assert_eq!(value["modelVersion"], "1-abcdef0123456789");
        assert_eq!(value["configuration"], json!(["Running"]));
        assert_eq!(value["context"], json!({ "count": 3 }));
        assert_eq!(value["lastProcessedSequenceNumber"], 12);
        assert_eq!(value["sourceWatermarks"], json!({ "pinger": 7 }));
        assert_eq!(value["status"], "idle");
        assert!(value.get("pendingInvocations").is_none());

        let back: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_pending_invocations_survive_serialization() {
        let request = InvocationRequest {
            id: "quoter-3".to_string(),
            service: "pricing".to_string(),
            input: json!({ "sku": "a" }),
            timeout: std::time::Duration::from_millis(200),
            done_event: "done.invoke.pricing".to_string(),
            error_event: "error.invoke.pricing".to_string(),
            local: false,
        };
        let checkpoint = Checkpoint::new("quoter", "1-x", vec!["Waiting".into()], Context::default(), Status::Idle)
            .with_pending_invocations(vec![request.clone()]);

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["pendingInvocations"][0]["id"], "quoter-3");
        assert_eq!(value["pendingInvocations"][0]["errorEvent"], "error.invoke.pricing");

        let back: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back.pending_invocations, vec![request]);
    }

    #[test]
    fn test_has_processed() {
        let mut marks = Watermarks::new();
        marks.insert("a".to_string(), 5);
        let checkpoint = Checkpoint::new("i-1", "1-x", vec![], Context::default(), Status::Idle)
            .with_delivery(0, marks, 0);
        assert!(checkpoint.has_processed("a", 5));
        assert!(!checkpoint.has_processed("a", 6));
        assert!(!checkpoint.has_processed("b", 1));
    }
}
