//! # csmr-router
//!
//! Event router for csmr.
//!
//! This crate provides:
//! - Subscriptions with dot-separated wildcard patterns
//! - Per-instance inboxes delivering in order, with retries and backoff
//! - Delivery-failure notifications
//! - Checkpoint redelivery from a bounded journal
//! - A TCP bridge between routers on different nodes

pub mod endpoint;
pub mod error;
pub mod inbox;
pub mod pattern;
pub mod peer;
pub mod receive;
pub mod router;

pub use endpoint::{Delivery, Endpoint, MailboxEndpoint};
pub use error::{DeliveryError, RouterError};
pub use inbox::{DeliveryFailure, InboxStatus, RetryPolicy};
pub use pattern::Pattern;
pub use peer::{PeerConfig, PeerLink, RouterServer, RouterServerConfig, ServerStats};
pub use receive::{scope_for, to_core_event, to_wire_event, Deduplicator};
pub use router::{EventRouter, Publisher, RouterConfig, RouterStats, SubscriptionHandle};
