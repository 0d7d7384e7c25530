//! The coordination capability and membership types.

use crate::error::CoordinationError;
use crate::lease::Lease;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// A registered instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub instance_id: String,
    /// Node whose session registered the instance.
    pub node_id: String,
    pub session_id: u64,
    /// Free-form metadata, typically the instance's status report.
    #[serde(default)]
    pub metadata: Value,
}

/// Why an instance left the membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Deregistered,
    SessionClosed,
    SessionExpired,
}

/// A change in the membership view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipEvent {
    Joined(Member),
    Updated(Member),
    Left {
        instance_id: String,
        node_id: String,
        reason: LeaveReason,
    },
}

impl MembershipEvent {
    pub fn instance_id(&self) -> &str {
        match self {
            MembershipEvent::Joined(m) | MembershipEvent::Updated(m) => &m.instance_id,
            MembershipEvent::Left { instance_id, .. } => instance_id,
        }
    }
}

/// The membership view at subscription time followed by its changes.
pub struct MembershipWatch {
    snapshot: Vec<Member>,
    receiver: broadcast::Receiver<MembershipEvent>,
}

impl MembershipWatch {
    pub fn new(snapshot: Vec<Member>, receiver: broadcast::Receiver<MembershipEvent>) -> Self {
        Self { snapshot, receiver }
    }

    /// Members registered when the watch was opened.
    pub fn snapshot(&self) -> &[Member] {
        &self.snapshot
    }

    /// Waits for the next change. Returns `None` once the backend is gone.
    ///
    /// A watcher that falls too far behind skips the missed changes and
    /// should re-read the view with a fresh watch.
    pub async fn next(&mut self) -> Option<MembershipEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("membership watch lagged, {} change(s) missed", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Distributed membership and locking, as seen by one node.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Registers an instance, or updates its metadata if this node already
    /// registered it.
    async fn register(&self, instance_id: &str, metadata: Value) -> Result<(), CoordinationError>;

    /// Removes an instance registered by this node. Unknown ids are ignored.
    async fn deregister(&self, instance_id: &str) -> Result<(), CoordinationError>;

    async fn watch_membership(&self) -> Result<MembershipWatch, CoordinationError>;

    /// Takes the lock on `resource` if nobody holds it.
    ///
    /// Returns `None` while it is held, including by this node: locks are
    /// not reentrant.
    async fn try_acquire_lock(&self, resource: &str) -> Result<Option<Lease>, CoordinationError>;
}
