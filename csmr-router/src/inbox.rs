//! Per-instance inbox: a bounded journal and its delivery worker.
//!
//! Every event routed to an instance is appended to its journal under the
//! next inbox sequence number. A single worker hands entries to the attached
//! endpoint strictly in journal order, so events from one source reach the
//! target in send order. Delivered entries stay in the journal until the
//! capacity forces them out, which is what lets a restarted instance ask for
//! redelivery from its last checkpoint.

use crate::endpoint::{Delivery, Endpoint};
use crate::error::{DeliveryError, RouterError};
use crate::router::RouterStats;
use csmr_protocol::{TargetScope, WireEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

/// Retry schedule for a failing delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per event, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Notification that an event was dropped without reaching its target.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    /// Instance (or `peer:<addr>`) the event was meant for.
    pub target: String,
    /// Inbox position, if the event made it into the journal.
    pub inbox_sequence: Option<u64>,
    pub event: WireEvent,
    pub attempts: u32,
    pub error: String,
}

/// Point-in-time view of one inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxStatus {
    pub owner: String,
    pub attached: bool,
    /// Entries currently retained, delivered or not.
    pub journaled: usize,
    /// Entries not yet handed to the endpoint.
    pub pending: u64,
    /// Next inbox sequence number to deliver.
    pub cursor: u64,
}

struct Journal {
    entries: VecDeque<Delivery>,
    next_sequence: u64,
    cursor: u64,
    endpoint: Option<Arc<dyn Endpoint>>,
    generation: u64,
}

impl Journal {
    fn first_sequence(&self) -> u64 {
        self.entries
            .front()
            .map(|d| d.inbox_sequence)
            .unwrap_or(self.next_sequence)
    }

    fn head(&self) -> Option<&Delivery> {
        let first = self.first_sequence();
        if self.cursor < first {
            return None;
        }
        self.entries.get((self.cursor - first) as usize)
    }

    /// Moves the cursor to the first retained entry after `after`.
    fn rewind(&mut self, owner: &str, after: u64) {
        let wanted = after.saturating_add(1);
        if wanted > self.next_sequence {
            // The journal started after the checkpoint was taken (fresh
            // router): continue numbering from the checkpoint instead.
            let cursor = self.cursor;
            let undelivered: Vec<Delivery> = self
                .entries
                .drain(..)
                .filter(|d| d.inbox_sequence >= cursor)
                .collect();
            self.cursor = wanted;
            self.next_sequence = wanted;
            for mut delivery in undelivered {
                delivery.inbox_sequence = self.next_sequence;
                self.next_sequence += 1;
                self.entries.push_back(delivery);
            }
            tracing::debug!(
                "[{}] journal renumbered from {} ({} pending)",
                owner,
                wanted,
                self.entries.len()
            );
            return;
        }

        let first = self.first_sequence();
        if wanted < first {
            tracing::warn!(
                "[{}] redelivery requested from {} but journal starts at {}",
                owner,
                wanted,
                first
            );
        }
        self.cursor = wanted.max(first);
    }
}

/// One instance's inbox.
pub(crate) struct Inbox {
    owner: String,
    capacity: usize,
    journal: Mutex<Journal>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl Inbox {
    pub(crate) fn new(owner: impl Into<String>, capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            owner: owner.into(),
            capacity: capacity.max(1),
            journal: Mutex::new(Journal {
                entries: VecDeque::new(),
                next_sequence: 1,
                cursor: 1,
                endpoint: None,
                generation: 0,
            }),
            wake: Notify::new(),
            shutdown,
        }
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }

    /// Appends an event and returns its inbox sequence number.
    ///
    /// Already delivered entries are evicted to make room; undelivered ones
    /// never are.
    pub(crate) fn enqueue(&self, scope: TargetScope, event: WireEvent) -> Result<u64, RouterError> {
        let mut journal = self.journal.lock();
        if journal.entries.len() >= self.capacity {
            let cursor = journal.cursor;
            match journal.entries.front() {
                Some(front) if front.inbox_sequence < cursor => {
                    journal.entries.pop_front();
                }
                _ => {
                    return Err(RouterError::InboxFull {
                        instance: self.owner.clone(),
                        capacity: self.capacity,
                    })
                }
            }
        }

        let inbox_sequence = journal.next_sequence;
        journal.next_sequence += 1;
        journal.entries.push_back(Delivery {
            inbox_sequence,
            scope,
            event,
        });
        drop(journal);

        self.wake.notify_one();
        Ok(inbox_sequence)
    }

    /// Binds an endpoint. With `resume_after`, delivery restarts from the
    /// first retained entry after that inbox sequence number.
    pub(crate) fn attach(&self, endpoint: Arc<dyn Endpoint>, resume_after: Option<u64>) {
        let mut journal = self.journal.lock();
        tracing::debug!("[{}] attached {}", self.owner, endpoint.describe());
        journal.endpoint = Some(endpoint);
        if let Some(after) = resume_after {
            journal.rewind(&self.owner, after);
        }
        journal.generation += 1;
        drop(journal);
        self.wake.notify_one();
    }

    pub(crate) fn detach(&self) {
        let mut journal = self.journal.lock();
        journal.endpoint = None;
        journal.generation += 1;
    }

    /// Detaches only if `endpoint` is the one currently bound.
    pub(crate) fn detach_if(&self, endpoint: &Arc<dyn Endpoint>) -> bool {
        let mut journal = self.journal.lock();
        let bound = journal
            .endpoint
            .as_ref()
            .is_some_and(|current| Arc::as_ptr(current) as *const () == Arc::as_ptr(endpoint) as *const ());
        if bound {
            journal.endpoint = None;
            journal.generation += 1;
        }
        bound
    }

    pub(crate) fn close(&self) {
        self.shutdown.send_replace(true);
        self.wake.notify_one();
    }

    pub(crate) fn status(&self) -> InboxStatus {
        let journal = self.journal.lock();
        InboxStatus {
            owner: self.owner.clone(),
            attached: journal.endpoint.is_some(),
            journaled: journal.entries.len(),
            pending: journal.next_sequence.saturating_sub(journal.cursor),
            cursor: journal.cursor,
        }
    }

    fn generation(&self) -> u64 {
        self.journal.lock().generation
    }

    fn head(&self) -> Option<(Delivery, Option<Arc<dyn Endpoint>>, u64)> {
        let journal = self.journal.lock();
        journal
            .head()
            .map(|d| (d.clone(), journal.endpoint.clone(), journal.generation))
    }

    /// Advances past `inbox_sequence` unless the inbox was rewound or
    /// re-attached in the meantime.
    fn complete(&self, inbox_sequence: u64, generation: u64) -> bool {
        let mut journal = self.journal.lock();
        if journal.generation != generation || journal.cursor != inbox_sequence {
            return false;
        }
        journal.cursor += 1;
        true
    }
}

enum Outcome {
    Delivered,
    Failed { attempts: u32, error: DeliveryError },
    Superseded,
    Shutdown,
}

/// Spawns the delivery worker for an inbox.
pub(crate) fn spawn_worker(
    inbox: Arc<Inbox>,
    policy: RetryPolicy,
    failures: broadcast::Sender<DeliveryFailure>,
    stats: Arc<RouterStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = inbox.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some((delivery, endpoint, generation)) = inbox.head() else {
                tokio::select! {
                    _ = inbox.wake.notified() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            let outcome = deliver_with_retry(&inbox, &delivery, endpoint, generation, &policy, &stats, &mut shutdown).await;
            match outcome {
                Outcome::Delivered => {
                    if inbox.complete(delivery.inbox_sequence, generation) {
                        stats.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Outcome::Failed { attempts, error } => {
                    if inbox.complete(delivery.inbox_sequence, generation) {
                        tracing::warn!(
                            "[{}] dropping {} #{} from {} after {} attempt(s): {}",
                            inbox.owner(),
                            delivery.event.name,
                            delivery.event.sequence_number,
                            delivery.event.source_instance_id,
                            attempts,
                            error
                        );
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        let _ = failures.send(DeliveryFailure {
                            target: inbox.owner().to_string(),
                            inbox_sequence: Some(delivery.inbox_sequence),
                            event: delivery.event,
                            attempts,
                            error: error.to_string(),
                        });
                    }
                }
                Outcome::Superseded => {}
                Outcome::Shutdown => break,
            }
        }
        tracing::debug!("[{}] delivery worker stopped", inbox.owner());
    })
}

async fn deliver_with_retry(
    inbox: &Inbox,
    delivery: &Delivery,
    endpoint: Option<Arc<dyn Endpoint>>,
    generation: u64,
    policy: &RetryPolicy,
    stats: &RouterStats,
    shutdown: &mut watch::Receiver<bool>,
) -> Outcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = match &endpoint {
            Some(endpoint) => tokio::select! {
                result = endpoint.deliver(delivery) => result,
                _ = shutdown.changed() => return Outcome::Shutdown,
            },
            None => Err(DeliveryError::Unavailable("no endpoint attached".into())),
        };

        let error = match result {
            Ok(()) => return Outcome::Delivered,
            Err(error) => error,
        };
        if !error.is_retryable() || attempts >= policy.max_attempts {
            return Outcome::Failed { attempts, error };
        }

        let delay = policy.backoff(attempts - 1);
        tracing::debug!(
            "[{}] delivery of #{} failed ({}), retrying in {:?}",
            inbox.owner(),
            delivery.inbox_sequence,
            error,
            delay
        );
        stats.retries.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return Outcome::Shutdown,
        }
        if inbox.generation() != generation {
            return Outcome::Superseded;
        }
    }
}
