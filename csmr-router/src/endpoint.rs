//! Delivery endpoints.

use crate::error::DeliveryError;
use async_trait::async_trait;
use csmr_protocol::{TargetScope, WireEvent};
use tokio::sync::mpsc;

/// One journaled event on its way to an inbox owner.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Position in the receiving inbox, strictly increasing per inbox.
    pub inbox_sequence: u64,
    /// Scope the event was published with.
    pub scope: TargetScope,
    pub event: WireEvent,
}

/// Something an inbox can hand events to.
///
/// `deliver` returning `Ok` means the event is accepted and the inbox may
/// move on to the next one. An endpoint that is alive but busy should wait
/// rather than fail; errors count against the retry budget.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError>;

    /// Human-readable description, used in logs.
    fn describe(&self) -> String;
}

/// In-process endpoint backed by a bounded channel.
///
/// A full channel holds the delivery until the owner drains it. Only a
/// dropped receiver is reported as unavailable.
#[derive(Debug, Clone)]
pub struct MailboxEndpoint {
    name: String,
    sender: mpsc::Sender<Delivery>,
}

impl MailboxEndpoint {
    /// Creates an endpoint together with the receiving end.
    pub fn channel(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }
}

#[async_trait]
impl Endpoint for MailboxEndpoint {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        self.sender
            .send(delivery.clone())
            .await
            .map_err(|_| DeliveryError::Unavailable(format!("mailbox {} is closed", self.name)))
    }

    fn describe(&self) -> String {
        format!("mailbox:{}", self.name)
    }
}
