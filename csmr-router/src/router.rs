//! Event routing between instances.

use crate::endpoint::Endpoint;
use crate::error::RouterError;
use crate::inbox::{spawn_worker, DeliveryFailure, Inbox, InboxStatus, RetryPolicy};
use crate::pattern::Pattern;
use csmr_protocol::{TargetScope, WireEvent};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default capacity of the delivery-failure channel.
const DEFAULT_FAILURE_CAPACITY: usize = 256;

/// Prefix of the inbox names used for peer routers.
pub const PEER_PREFIX: &str = "peer:";

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Identity of this router, sent to peers.
    pub node_id: String,
    /// Maximum number of journaled entries per inbox.
    pub inbox_capacity: usize,
    pub retry: RetryPolicy,
    pub failure_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            inbox_capacity: 1024,
            retry: RetryPolicy::default(),
            failure_capacity: DEFAULT_FAILURE_CAPACITY,
        }
    }
}

impl RouterConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Router statistics.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub published: AtomicU64,
    pub enqueued: AtomicU64,
    pub delivered: AtomicU64,
    pub retries: AtomicU64,
    pub dropped: AtomicU64,
    pub forwarded: AtomicU64,
}

/// Identifies one subscription; pass it back to [`EventRouter::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: String,
    pub instance_id: String,
    pub pattern: String,
}

struct Subscription {
    instance_id: String,
    pattern: Pattern,
}

struct InboxSlot {
    inbox: Arc<Inbox>,
    worker: JoinHandle<()>,
}

/// In-process publish/subscribe router.
///
/// Inboxes and their workers are spawned on the current tokio runtime, so
/// `subscribe`, `attach` and `add_peer` must be called from within one.
pub struct EventRouter {
    config: RouterConfig,
    inboxes: DashMap<String, InboxSlot>,
    subscriptions: DashMap<String, Subscription>,
    peers: DashSet<String>,
    failures: broadcast::Sender<DeliveryFailure>,
    stats: Arc<RouterStats>,
}

impl EventRouter {
    pub fn new(config: RouterConfig) -> Self {
        let (failures, _) = broadcast::channel(config.failure_capacity.max(1));
        Self {
            config,
            inboxes: DashMap::new(),
            subscriptions: DashMap::new(),
            peers: DashSet::new(),
            failures,
            stats: Arc::new(RouterStats::default()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Returns a publisher for `source`, continuing after `last_sequence`.
    pub fn publisher(self: &Arc<Self>, source: impl Into<String>, last_sequence: u64) -> Publisher {
        Publisher {
            router: Arc::clone(self),
            source: source.into(),
            last_sequence: Mutex::new(last_sequence),
        }
    }

    /// Subscribes an instance to every event whose name matches `pattern`.
    pub fn subscribe(&self, instance_id: &str, pattern: &str) -> Result<SubscriptionHandle, RouterError> {
        let parsed = Pattern::parse(pattern)?;
        self.ensure_inbox(instance_id);

        let id = format!("sub-{}", uuid::Uuid::new_v4());
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                instance_id: instance_id.to_string(),
                pattern: parsed,
            },
        );
        tracing::debug!("{} subscribed to '{}' ({})", instance_id, pattern, id);

        Ok(SubscriptionHandle {
            id,
            instance_id: instance_id.to_string(),
            pattern: pattern.to_string(),
        })
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscriptions.remove(&handle.id).is_some()
    }

    /// Returns the patterns an instance is subscribed to.
    pub fn subscriptions_of(&self, instance_id: &str) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|s| s.instance_id == instance_id)
            .map(|s| s.pattern.as_str().to_string())
            .collect();
        patterns.sort();
        patterns
    }

    /// Binds an endpoint to an instance's inbox.
    ///
    /// With `resume_after = Some(n)`, every retained entry with an inbox
    /// sequence number above `n` is delivered again.
    pub fn attach(&self, instance_id: &str, endpoint: Arc<dyn Endpoint>, resume_after: Option<u64>) {
        self.ensure_inbox(instance_id).attach(endpoint, resume_after);
    }

    /// Unbinds the endpoint. The journal is kept so a later `attach` can
    /// resume from it.
    pub fn detach(&self, instance_id: &str) {
        if let Some(slot) = self.inboxes.get(instance_id) {
            slot.inbox.detach();
        }
    }

    /// Unbinds `endpoint` if it is still the one attached to the inbox.
    ///
    /// A previous owner calls this on its way out so it cannot unbind an
    /// endpoint a newer owner attached in the meantime.
    pub fn detach_endpoint(&self, instance_id: &str, endpoint: &Arc<dyn Endpoint>) -> bool {
        self.inboxes
            .get(instance_id)
            .is_some_and(|slot| slot.inbox.detach_if(endpoint))
    }

    /// Drops an instance: its subscriptions, journal and worker.
    pub fn remove_instance(&self, instance_id: &str) {
        self.subscriptions.retain(|_, s| s.instance_id != instance_id);
        if let Some((_, slot)) = self.inboxes.remove(instance_id) {
            slot.inbox.close();
            tracing::debug!("removed inbox of {}", instance_id);
        }
    }

    /// Forwards every locally published event to a peer router.
    pub fn add_peer(&self, name: &str, endpoint: Arc<dyn Endpoint>) {
        let key = format!("{}{}", PEER_PREFIX, name);
        self.ensure_inbox(&key).attach(endpoint, None);
        self.peers.insert(key);
        tracing::info!("added peer {}", name);
    }

    pub fn remove_peer(&self, name: &str) {
        let key = format!("{}{}", PEER_PREFIX, name);
        self.peers.remove(&key);
        self.remove_instance(&key);
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .iter()
            .map(|p| p.trim_start_matches(PEER_PREFIX).to_string())
            .collect();
        peers.sort();
        peers
    }

    /// Receiver for events dropped after exhausting their retries.
    pub fn delivery_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.failures.subscribe()
    }

    pub fn inbox_status(&self, instance_id: &str) -> Option<InboxStatus> {
        self.inboxes.get(instance_id).map(|slot| slot.inbox.status())
    }

    /// Returns the instances with an inbox on this router, peers excluded.
    pub fn instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inboxes
            .iter()
            .map(|slot| slot.key().clone())
            .filter(|id| !id.starts_with(PEER_PREFIX))
            .collect();
        ids.sort();
        ids
    }

    /// Publishes an event and forwards it to peers.
    ///
    /// Never blocks: problems are reported on the delivery-failure channel.
    /// Returns the number of inboxes the event was journaled in.
    pub fn publish(&self, event: WireEvent, scope: TargetScope) -> usize {
        match self.route(event.clone(), scope.clone(), true) {
            Ok(count) => count,
            Err(err) => {
                let target = match &scope {
                    TargetScope::Instance { id } => id.clone(),
                    _ => String::new(),
                };
                self.report_failure(target, event, err.to_string());
                0
            }
        }
    }

    /// Routes an event to local inboxes and, when `forward` is set, to peers.
    ///
    /// A direct event that cannot be journaled anywhere is an error, since
    /// there is a single caller to tell. For subscriber scopes the failures
    /// of individual inboxes are reported on the failure channel.
    pub fn route(&self, event: WireEvent, scope: TargetScope, forward: bool) -> Result<usize, RouterError> {
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let targets = self.targets(&event, &scope);
        let mut journaled = 0;
        for target in &targets {
            let Some(inbox) = self.inboxes.get(target).map(|slot| slot.inbox.clone()) else {
                continue;
            };
            match inbox.enqueue(scope.clone(), event.clone()) {
                Ok(_) => {
                    journaled += 1;
                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) if matches!(scope, TargetScope::Instance { .. }) => return Err(err),
                Err(err) => self.report_failure(target.clone(), event.clone(), err.to_string()),
            }
        }

        let handled_locally = matches!(scope, TargetScope::Instance { .. }) && journaled > 0;
        if forward && !handled_locally {
            let peers: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
            for peer in peers {
                let Some(inbox) = self.inboxes.get(&peer).map(|slot| slot.inbox.clone()) else {
                    continue;
                };
                match inbox.enqueue(scope.clone(), event.clone()) {
                    Ok(_) => {
                        journaled += 1;
                        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => self.report_failure(peer, event.clone(), err.to_string()),
                }
            }
        }

        if journaled == 0 {
            if let TargetScope::Instance { id } = &scope {
                return Err(RouterError::UnknownInstance(id.clone()));
            }
            tracing::trace!("no subscriber for {}", event.name);
        }
        Ok(journaled)
    }

    /// Closes every inbox and stops the workers.
    pub fn shutdown(&self) {
        for slot in self.inboxes.iter() {
            slot.inbox.close();
        }
    }

    fn targets(&self, event: &WireEvent, scope: &TargetScope) -> BTreeSet<String> {
        match scope {
            TargetScope::Instance { id } => {
                if self.inboxes.contains_key(id) {
                    BTreeSet::from([id.clone()])
                } else {
                    BTreeSet::new()
                }
            }
            TargetScope::Subscribers | TargetScope::Everyone => {
                let include_source = matches!(scope, TargetScope::Everyone);
                self.subscriptions
                    .iter()
                    .filter(|s| include_source || s.instance_id != event.source_instance_id)
                    .filter(|s| s.pattern.matches(&event.name))
                    .map(|s| s.instance_id.clone())
                    .collect()
            }
        }
    }

    fn ensure_inbox(&self, instance_id: &str) -> Arc<Inbox> {
        self.inboxes
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                let inbox = Arc::new(Inbox::new(instance_id, self.config.inbox_capacity));
                let worker = spawn_worker(
                    inbox.clone(),
                    self.config.retry,
                    self.failures.clone(),
                    self.stats.clone(),
                );
                InboxSlot { inbox, worker }
            })
            .inbox
            .clone()
    }

    fn report_failure(&self, target: String, event: WireEvent, error: String) {
        tracing::warn!("cannot route {} to {}: {}", event.name, target, error);
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        let _ = self.failures.send(DeliveryFailure {
            target,
            inbox_sequence: None,
            event,
            attempts: 0,
            error,
        });
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        for slot in self.inboxes.iter() {
            slot.inbox.close();
            slot.worker.abort();
        }
    }
}

/// Publishes events on behalf of one source instance.
///
/// Sequence numbers are assigned under a lock held across routing, so
/// events from one publisher enter every inbox in sequence order.
pub struct Publisher {
    router: Arc<EventRouter>,
    source: String,
    last_sequence: Mutex<u64>,
}

impl Publisher {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Sequence number of the last published event.
    pub fn last_sequence(&self) -> u64 {
        *self.last_sequence.lock()
    }

    /// Publishes an event and returns its sequence number.
    pub fn publish(&self, name: impl Into<String>, payload: Value, scope: TargetScope) -> u64 {
        let mut last = self.last_sequence.lock();
        *last += 1;
        let event = WireEvent::new(name, self.source.clone(), *last).with_payload(payload);
        self.router.publish(event, scope);
        *last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Delivery, MailboxEndpoint};
    use crate::error::DeliveryError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn router() -> Arc<EventRouter> {
        Arc::new(EventRouter::new(RouterConfig::new("test").with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        })))
    }

    fn mailbox(router: &EventRouter, instance: &str) -> mpsc::Receiver<Delivery> {
        let (endpoint, rx) = MailboxEndpoint::channel(instance, 64);
        router.attach(instance, Arc::new(endpoint), None);
        rx
    }

    async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("mailbox closed")
    }

    /// Fails every other attempt before accepting.
    struct Flaky {
        calls: AtomicU32,
        sender: mpsc::UnboundedSender<Delivery>,
    }

    #[async_trait]
    impl Endpoint for Flaky {
        async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(DeliveryError::Timeout);
            }
            let _ = self.sender.send(delivery.clone());
            Ok(())
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    struct Refusing;

    #[async_trait]
    impl Endpoint for Refusing {
        async fn deliver(&self, _: &Delivery) -> Result<(), DeliveryError> {
            Err(DeliveryError::Unavailable("down".into()))
        }

        fn describe(&self) -> String {
            "refusing".into()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_order_survives_retries() {
        let router = router();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.attach(
            "B",
            Arc::new(Flaky {
                calls: AtomicU32::new(0),
                sender: tx,
            }),
            None,
        );
        router.subscribe("A", "ping").unwrap();
        router.subscribe("B", "ping").unwrap();

        let a = router.publisher("A", 0);
        for _ in 0..3 {
            a.publish("ping", Value::Null, TargetScope::Subscribers);
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert_eq!(delivery.event.source_instance_id, "A");
            seen.push(delivery.event.sequence_number);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(a.last_sequence(), 3);
        assert!(router.stats().retries.load(Ordering::Relaxed) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_mailbox_keeps_every_event() {
        let router = router();
        let (endpoint, mut rx) = MailboxEndpoint::channel("B", 1);
        router.attach("B", Arc::new(endpoint), None);
        router.subscribe("B", "ping").unwrap();

        let a = router.publisher("A", 0);
        for _ in 0..3 {
            a.publish("ping", Value::Null, TargetScope::Subscribers);
        }

        // The owner is alive but takes far longer than the retry budget per event.
        let mut seen = Vec::new();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            seen.push(recv(&mut rx).await.event.sequence_number);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(router.stats().dropped.load(Ordering::Relaxed), 0);
        assert_eq!(router.stats().delivered.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_subscribers_scope_excludes_source() {
        let router = router();
        let mut a_rx = mailbox(&router, "A");
        let mut b_rx = mailbox(&router, "B");
        router.subscribe("A", "job.*").unwrap();
        router.subscribe("B", "job.*").unwrap();

        let a = router.publisher("A", 0);
        a.publish("job.done", json!({"id": 7}), TargetScope::Subscribers);

        let delivery = recv(&mut b_rx).await;
        assert_eq!(delivery.event.name, "job.done");
        assert_eq!(delivery.event.payload, json!({"id": 7}));
        assert_eq!(delivery.inbox_sequence, 1);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_everyone_scope_includes_source() {
        let router = router();
        let mut a_rx = mailbox(&router, "A");
        router.subscribe("A", "tick").unwrap();

        router.publisher("A", 0).publish("tick", Value::Null, TargetScope::Everyone);
        let delivery = recv(&mut a_rx).await;
        assert_eq!(delivery.scope, TargetScope::Everyone);
    }

    #[tokio::test]
    async fn test_overlapping_patterns_deliver_once() {
        let router = router();
        let mut b_rx = mailbox(&router, "B");
        router.subscribe("B", "job.*").unwrap();
        router.subscribe("B", "job.>").unwrap();

        assert_eq!(
            router.publish(WireEvent::new("job.done", "A", 1), TargetScope::Subscribers),
            1
        );
        recv(&mut b_rx).await;
        assert_eq!(router.inbox_status("B").unwrap().journaled, 1);
    }

    #[tokio::test]
    async fn test_direct_scope_ignores_subscriptions() {
        let router = router();
        let mut b_rx = mailbox(&router, "B");

        router.publish(WireEvent::new("wake", "ext", 1), TargetScope::instance("B"));
        assert_eq!(recv(&mut b_rx).await.event.name, "wake");

        let err = router
            .route(WireEvent::new("wake", "ext", 2), TargetScope::instance("nobody"), true)
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownInstance(ref id) if id == "nobody"));
    }

    #[tokio::test]
    async fn test_unknown_direct_target_reports_failure() {
        let router = router();
        let mut failures = router.delivery_failures();
        assert_eq!(router.publish(WireEvent::new("wake", "A", 1), TargetScope::instance("ghost")), 0);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.target, "ghost");
        assert_eq!(failure.attempts, 0);
        assert!(failure.error.contains("unknown instance"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let router = router();
        let _b_rx = mailbox(&router, "B");
        let handle = router.subscribe("B", "ping").unwrap();
        assert_eq!(router.subscriptions_of("B"), vec!["ping".to_string()]);

        assert!(router.unsubscribe(&handle));
        assert!(!router.unsubscribe(&handle));
        assert_eq!(router.publish(WireEvent::new("ping", "A", 1), TargetScope::Subscribers), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_and_notify() {
        let router = router();
        let mut failures = router.delivery_failures();
        router.attach("B", Arc::new(Refusing), None);
        router.subscribe("B", "ping").unwrap();

        router.publisher("A", 0).publish("ping", Value::Null, TargetScope::Subscribers);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.target, "B");
        assert_eq!(failure.inbox_sequence, Some(1));
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.event.source_instance_id, "A");
        assert_eq!(router.stats().dropped.load(Ordering::Relaxed), 1);
        assert_eq!(router.inbox_status("B").unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_resume_after_redelivers_from_checkpoint() {
        let router = router();
        let mut first = mailbox(&router, "B");
        router.subscribe("B", "ping").unwrap();

        let a = router.publisher("A", 0);
        for _ in 0..4 {
            a.publish("ping", Value::Null, TargetScope::Subscribers);
        }
        for _ in 0..4 {
            recv(&mut first).await;
        }

        // The instance restarts having only processed inbox sequence 2.
        router.detach("B");
        let (endpoint, mut second) = MailboxEndpoint::channel("B", 64);
        router.attach("B", Arc::new(endpoint), Some(2));

        let third = recv(&mut second).await;
        let fourth = recv(&mut second).await;
        assert_eq!((third.inbox_sequence, fourth.inbox_sequence), (3, 4));
        assert_eq!(third.event.sequence_number, 3);
    }

    #[tokio::test]
    async fn test_peer_receives_forwarded_events() {
        let router = router();
        let (peer, mut peer_rx) = MailboxEndpoint::channel("remote", 8);
        router.add_peer("10.0.0.2:7411", Arc::new(peer));
        assert_eq!(router.peers(), vec!["10.0.0.2:7411".to_string()]);
        assert!(router.instances().is_empty());

        router.publish(WireEvent::new("ping", "A", 1), TargetScope::Subscribers);
        let forwarded = recv(&mut peer_rx).await;
        assert_eq!(forwarded.event.name, "ping");
        assert_eq!(router.stats().forwarded.load(Ordering::Relaxed), 1);

        // Relayed events stay local.
        router.route(WireEvent::new("ping", "A", 2), TargetScope::Subscribers, false).unwrap();
        assert_eq!(router.stats().forwarded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_remove_instance() {
        let router = router();
        let _rx = mailbox(&router, "B");
        router.subscribe("B", "ping").unwrap();
        router.remove_instance("B");

        assert!(router.inbox_status("B").is_none());
        assert!(router.subscriptions_of("B").is_empty());
    }

    #[tokio::test]
    async fn test_detach_endpoint_spares_newer_owner() {
        let router = router();
        let (old, _old_rx) = MailboxEndpoint::channel("B-old", 8);
        let old: Arc<dyn Endpoint> = Arc::new(old);
        router.attach("B", old.clone(), None);
        let _new_rx = mailbox(&router, "B");

        assert!(!router.detach_endpoint("B", &old));
        assert_eq!(router.inbox_status("B").map(|s| s.attached), Some(true));

        let (only, _rx) = MailboxEndpoint::channel("C", 8);
        let only: Arc<dyn Endpoint> = Arc::new(only);
        router.attach("C", only.clone(), None);
        assert!(router.detach_endpoint("C", &only));
        assert_eq!(router.inbox_status("C").map(|s| s.attached), Some(false));
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let router = router();
        assert!(matches!(
            router.subscribe("B", "a.>.b"),
            Err(RouterError::InvalidPattern { .. })
        ));
    }
}
