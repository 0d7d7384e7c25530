//! In-process coordinator.
//!
//! All nodes of a deployment share one [`LocalCoordinator`]; each node talks
//! to it through its own [`Session`]. A session that stops heartbeating for
//! longer than its timeout expires: its instances leave the membership and
//! its leases are revoked. Expiry is checked on every operation and by the
//! reaper loop, whichever comes first.

use crate::coordination::{Coordination, LeaveReason, Member, MembershipEvent, MembershipWatch};
use crate::error::CoordinationError;
use crate::lease::{Lease, LeaseBackend};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default membership channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

struct SessionEntry {
    node_id: String,
    timeout: Duration,
    last_heartbeat: Instant,
    instances: BTreeSet<String>,
    locks: BTreeSet<String>,
}

struct LockEntry {
    session: u64,
    holder: String,
    token: u64,
    revoke: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    next_session: u64,
    sessions: HashMap<u64, SessionEntry>,
    members: BTreeMap<String, Member>,
    locks: HashMap<String, LockEntry>,
    /// Last token issued per resource.
    tokens: HashMap<String, u64>,
}

impl State {
    fn expire(&mut self, now: Instant, events: &mut Vec<MembershipEvent>) {
        let expired: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_heartbeat) > s.timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::warn!("session {} expired", id);
            self.end_session(id, LeaveReason::SessionExpired, events);
        }
    }

    fn end_session(&mut self, id: u64, reason: LeaveReason, events: &mut Vec<MembershipEvent>) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        for instance_id in session.instances {
            if self.members.remove(&instance_id).is_some() {
                events.push(MembershipEvent::Left {
                    instance_id,
                    node_id: session.node_id.clone(),
                    reason,
                });
            }
        }
        for resource in session.locks {
            if let Some(lock) = self.locks.remove(&resource) {
                tracing::info!("lease on {} (token {}) revoked", resource, lock.token);
                lock.revoke.send_replace(true);
            }
        }
    }

    fn live_session(&mut self, id: u64) -> Result<&mut SessionEntry, CoordinationError> {
        self.sessions
            .get_mut(&id)
            .ok_or(CoordinationError::SessionExpired(id))
    }
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Inner {
    /// Runs `f` against the state after applying expiry, then publishes the
    /// membership changes it produced.
    fn with_state<T>(&self, f: impl FnOnce(&mut State, &mut Vec<MembershipEvent>) -> T) -> T {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            state.expire(Instant::now(), &mut events);
            f(&mut state, &mut events)
        };
        for event in events {
            let _ = self.events.send(event);
        }
        result
    }
}

impl LeaseBackend for Inner {
    fn release(&self, resource: &str, token: u64) {
        self.with_state(|state, _| {
            let held = state
                .locks
                .get(resource)
                .is_some_and(|lock| lock.token == token);
            if !held {
                return;
            }
            if let Some(lock) = state.locks.remove(resource) {
                if let Some(session) = state.sessions.get_mut(&lock.session) {
                    session.locks.remove(resource);
                }
                lock.revoke.send_replace(true);
                tracing::debug!("lease on {} (token {}) released", resource, token);
            }
        })
    }

    fn refresh(&self) {
        self.with_state(|_, _| ())
    }
}

/// Who holds a lock right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub holder: String,
    pub session_id: u64,
    pub token: u64,
}

/// Coordinator shared by every node in the process.
#[derive(Clone)]
pub struct LocalCoordinator {
    inner: Arc<Inner>,
}

impl Default for LocalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    /// Opens a session for `node_id`.
    pub fn open_session(&self, node_id: impl Into<String>, timeout: Duration) -> Session {
        let node_id = node_id.into();
        let id = self.inner.with_state(|state, _| {
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(
                id,
                SessionEntry {
                    node_id: node_id.clone(),
                    timeout,
                    last_heartbeat: Instant::now(),
                    instances: BTreeSet::new(),
                    locks: BTreeSet::new(),
                },
            );
            id
        });
        tracing::debug!("session {} opened for {} (timeout {:?})", id, node_id, timeout);

        Session {
            id,
            node_id,
            timeout,
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Applies session expiry now.
    pub fn reap(&self) {
        self.inner.refresh();
    }

    /// Reaps expired sessions every `interval`, forever.
    pub async fn run_reaper(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.reap();
        }
    }

    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_reaper(interval))
    }

    /// Current membership.
    pub fn members(&self) -> Vec<Member> {
        self.inner
            .with_state(|state, _| state.members.values().cloned().collect())
    }

    pub fn lock_holder(&self, resource: &str) -> Option<LockHolder> {
        self.inner.with_state(|state, _| {
            state.locks.get(resource).map(|lock| LockHolder {
                holder: lock.holder.clone(),
                session_id: lock.session,
                token: lock.token,
            })
        })
    }

    pub fn session_count(&self) -> usize {
        self.inner.with_state(|state, _| state.sessions.len())
    }
}

/// One node's connection to the coordinator.
///
/// Dropping a session does not close it; it expires once heartbeats stop,
/// the same way a crashed node's session does.
pub struct Session {
    id: u64,
    node_id: String,
    timeout: Duration,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Refreshes the session's heartbeat.
    pub fn keep_alive(&self) -> Result<(), CoordinationError> {
        self.check_open()?;
        self.inner.with_state(|state, _| {
            let session = state.live_session(self.id)?;
            session.last_heartbeat = Instant::now();
            Ok(())
        })
    }

    /// Heartbeats every `interval` until the session is closed or expires.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = session.keep_alive() {
                    tracing::warn!("keepalive for {} stopped: {}", session.node_id, e);
                    break;
                }
            }
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self
                .inner
                .with_state(|state, _| state.sessions.contains_key(&self.id))
    }

    /// Ends the session: deregisters its instances and releases its leases.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.with_state(|state, events| {
            state.end_session(self.id, LeaveReason::SessionClosed, events);
        });
        tracing::debug!("session {} closed", self.id);
    }

    fn check_open(&self) -> Result<(), CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::SessionClosed(self.id));
        }
        Ok(())
    }

    fn backend(&self) -> Weak<dyn LeaseBackend> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        weak
    }
}

#[async_trait]
impl Coordination for Session {
    async fn register(&self, instance_id: &str, metadata: Value) -> Result<(), CoordinationError> {
        self.check_open()?;
        self.inner.with_state(|state, events| {
            state.live_session(self.id)?;
            if let Some(existing) = state.members.get_mut(instance_id) {
                if existing.session_id != self.id {
                    return Err(CoordinationError::AlreadyRegistered {
                        instance: instance_id.to_string(),
                        node: existing.node_id.clone(),
                    });
                }
                existing.metadata = metadata;
                events.push(MembershipEvent::Updated(existing.clone()));
                return Ok(());
            }

            let member = Member {
                instance_id: instance_id.to_string(),
                node_id: self.node_id.clone(),
                session_id: self.id,
                metadata,
            };
            state.members.insert(instance_id.to_string(), member.clone());
            state.live_session(self.id)?.instances.insert(instance_id.to_string());
            tracing::info!("{} joined from {}", instance_id, self.node_id);
            events.push(MembershipEvent::Joined(member));
            Ok(())
        })
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), CoordinationError> {
        self.check_open()?;
        self.inner.with_state(|state, events| {
            state.live_session(self.id)?;
            match state.members.get(instance_id) {
                None => return Ok(()),
                Some(member) if member.session_id != self.id => {
                    return Err(CoordinationError::NotOwner(instance_id.to_string()))
                }
                Some(_) => {}
            }
            state.members.remove(instance_id);
            state.live_session(self.id)?.instances.remove(instance_id);
            events.push(MembershipEvent::Left {
                instance_id: instance_id.to_string(),
                node_id: self.node_id.clone(),
                reason: LeaveReason::Deregistered,
            });
            Ok(())
        })
    }

    async fn watch_membership(&self) -> Result<MembershipWatch, CoordinationError> {
        self.check_open()?;
        self.inner.with_state(|state, _| {
            state.live_session(self.id)?;
            // Subscribing under the state lock keeps snapshot and stream gapless.
            let receiver = self.inner.events.subscribe();
            Ok(MembershipWatch::new(state.members.values().cloned().collect(), receiver))
        })
    }

    async fn try_acquire_lock(&self, resource: &str) -> Result<Option<Lease>, CoordinationError> {
        self.check_open()?;
        let backend = self.backend();
        self.inner.with_state(|state, _| {
            state.live_session(self.id)?;
            if state.locks.contains_key(resource) {
                return Ok(None);
            }

            let token = state.tokens.entry(resource.to_string()).or_insert(0);
            *token += 1;
            let token = *token;

            let (revoke, revoked) = watch::channel(false);
            state.locks.insert(
                resource.to_string(),
                LockEntry {
                    session: self.id,
                    holder: self.node_id.clone(),
                    token,
                    revoke,
                },
            );
            state.live_session(self.id)?.locks.insert(resource.to_string());
            tracing::info!("{} acquired lease on {} (token {})", self.node_id, resource, token);

            Ok(Some(Lease::new(resource, token, self.node_id.clone(), revoked, backend)))
        })
    }
}
