//! Instance supervisor.
//!
//! A [`Supervisor`] owns one instance for as long as it holds the
//! instance's lease. It feeds the interpreter one event at a time, executes
//! the effects each macro-step returns, writes a checkpoint after every
//! step and publishes the instance's status to the coordination registry.

use crate::config::Config;
use crate::error::RuntimeError;
use crate::invoker::{Completion, InvocationFailure, Invocations, ServiceRegistry};
use crate::metrics::Metrics;
use crate::timers::TimerSet;
use csmr_coord::{Coordination, Lease};
use csmr_core::{
    Effect, Event, FatalInterpreterFault, InvocationRequest, Interpreter, Model, Status, StepReport, Watermarks,
};
use csmr_router::{
    scope_for, Deduplicator, Delivery, DeliveryFailure, Endpoint, EventRouter, MailboxEndpoint, Publisher,
};
use csmr_storage::CheckpointStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Name of the lock guarding an instance.
pub fn lease_resource(instance_id: &str) -> String {
    format!("instance/{}", instance_id)
}

/// Event patterns an instance subscribes to when none are configured: the
/// events its transitions are triggered by, minus completion events raised
/// locally.
pub fn default_subscriptions(model: &Model) -> Vec<String> {
    model
        .transitions()
        .filter_map(|t| t.event.as_deref())
        .filter(|name| !name.starts_with("done.") && !name.starts_with("error."))
        .map(String::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Tunables of one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Explicit subscriptions; empty means [`default_subscriptions`].
    pub subscriptions: Vec<String>,
    pub mailbox_capacity: usize,
    pub lease_retry_interval: Duration,
    pub max_microsteps: usize,
    pub max_invocation_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            subscriptions: config.supervisor.subscriptions.clone(),
            mailbox_capacity: config.supervisor.mailbox_capacity,
            lease_retry_interval: config.coordination.lease_retry_interval(),
            max_microsteps: config.supervisor.max_microsteps,
            max_invocation_timeout: config.invocation.max_timeout(),
        }
    }
}

/// Everything a supervisor drives an instance with.
pub struct SupervisorParts {
    pub instance_id: String,
    pub model: Arc<Model>,
    pub router: Arc<EventRouter>,
    pub coordination: Arc<dyn Coordination>,
    /// `None` disables checkpointing.
    pub store: Option<Arc<CheckpointStore>>,
    pub services: Arc<ServiceRegistry>,
    pub metrics: Arc<Metrics>,
    pub settings: SupervisorSettings,
}

impl SupervisorParts {
    fn interpreter(&self) -> Interpreter {
        Interpreter::new(Arc::clone(&self.model), self.instance_id.clone())
            .with_max_microsteps(self.settings.max_microsteps)
    }
}

/// Most recent recoverable error of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// `evaluation_error`, `invocation_failure`, `delivery_failure`,
    /// `checkpoint_error` or `fatal_interpreter_fault`.
    pub kind: String,
    pub message: String,
}

impl LastError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// Status record published to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    pub last_processed_sequence_number: u64,
    pub configuration: Vec<String>,
}

/// Where a supervisor is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for the instance lease.
    #[default]
    Waiting,
    /// Processing events.
    Running,
    /// Completed or failed; holding the lease, ignoring events.
    Parked,
    Stopped,
}

/// Local view of a supervised instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub model_version: String,
    pub phase: Phase,
    /// Fencing token of the held lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<u64>,
    pub report: StatusReport,
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Shutdown was requested; the lease was released.
    Shutdown,
    /// The session expired; another node may now own the instance.
    LeaseLost,
    /// Another supervisor took over the inbox on this node.
    Detached,
}

/// Drives one instance.
pub struct Supervisor {
    parts: SupervisorParts,
    snapshot: watch::Sender<InstanceSnapshot>,
}

impl Supervisor {
    pub fn new(parts: SupervisorParts) -> Self {
        let (snapshot, _) = watch::channel(InstanceSnapshot {
            instance_id: parts.instance_id.clone(),
            model_version: parts.model.model_version(),
            phase: Phase::Waiting,
            lease_token: None,
            report: StatusReport::default(),
        });
        Self { parts, snapshot }
    }

    pub fn instance_id(&self) -> &str {
        &self.parts.instance_id
    }

    /// Follows the instance's local status.
    pub fn watch(&self) -> watch::Receiver<InstanceSnapshot> {
        self.snapshot.subscribe()
    }

    /// Waits for the lease, then drives the instance until shutdown or
    /// until the lease is lost.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<SupervisorExit, RuntimeError> {
        let metrics = Arc::clone(&self.parts.metrics);
        metrics.instances_waiting.inc();
        let acquired = self.acquire(&mut shutdown).await;
        metrics.instances_waiting.dec();

        let lease = match acquired {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                self.snapshot.send_modify(|s| s.phase = Phase::Stopped);
                return Ok(SupervisorExit::Shutdown);
            }
            Err(e) => {
                self.snapshot.send_modify(|s| s.phase = Phase::Stopped);
                return Err(e);
            }
        };
        tracing::info!(
            instance_id = %self.parts.instance_id,
            token = lease.token(),
            "lease acquired"
        );

        let mut driver = Driver::open(&self.parts, &self.snapshot, lease).await;
        let exit = driver.run(&mut shutdown).await;
        driver.close(exit).await;
        self.snapshot.send_modify(|s| {
            s.phase = Phase::Stopped;
            s.lease_token = None;
        });
        tracing::info!(instance_id = %self.parts.instance_id, "supervisor stopped ({:?})", exit);
        Ok(exit)
    }

    async fn acquire(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<Option<Lease>, RuntimeError> {
        let resource = lease_resource(&self.parts.instance_id);
        let mut announced = false;
        loop {
            match self.parts.coordination.try_acquire_lock(&resource).await {
                Ok(Some(lease)) => return Ok(Some(lease)),
                Ok(None) => {
                    if !announced {
                        tracing::info!(
                            instance_id = %self.parts.instance_id,
                            "{} is held elsewhere, waiting",
                            resource
                        );
                        announced = true;
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(instance_id = %self.parts.instance_id, "lease attempt failed: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
            tokio::select! {
                _ = shutdown.recv() => return Ok(None),
                _ = tokio::time::sleep(self.parts.settings.lease_retry_interval) => {}
            }
        }
    }
}

/// Per-lease state of a running instance.
struct Driver<'a> {
    parts: &'a SupervisorParts,
    snapshot: &'a watch::Sender<InstanceSnapshot>,
    lease: Lease,
    interpreter: Interpreter,
    publisher: Publisher,
    dedupe: Deduplicator,
    timers: TimerSet,
    invocations: Invocations,
    endpoint: Arc<dyn Endpoint>,
    deliveries: mpsc::Receiver<Delivery>,
    failures: broadcast::Receiver<DeliveryFailure>,
    failures_open: bool,
    last_processed: u64,
    last_error: Option<LastError>,
    counted_as: Option<Status>,
}

impl<'a> Driver<'a> {
    /// Restores or starts the instance and connects it to the router.
    async fn open(parts: &'a SupervisorParts, snapshot: &'a watch::Sender<InstanceSnapshot>, lease: Lease) -> Self {
        let id = parts.instance_id.as_str();
        let mut last_error = None;

        let checkpoint = match &parts.store {
            Some(store) => match store.load_latest(id) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    tracing::error!(instance_id = %id, "no usable checkpoint, starting fresh: {}", e);
                    last_error = Some(LastError::new("checkpoint_error", e.to_string()));
                    None
                }
            },
            None => None,
        };

        let mut interpreter = parts.interpreter();
        let mut restored = None;
        let mut interrupted: Vec<InvocationRequest> = Vec::new();
        let mut last_processed = 0;
        let mut watermarks = Watermarks::new();
        let mut last_published = 0;
        if let Some(checkpoint) = &checkpoint {
            // Delivery progress survives a model change: those events were consumed.
            last_processed = checkpoint.last_processed_sequence_number;
            watermarks = checkpoint.source_watermarks.clone();
            last_published = checkpoint.last_published_sequence_number;
            match interpreter.restore(checkpoint) {
                Ok(effects) => {
                    restored = Some(effects);
                    interrupted = checkpoint.pending_invocations.clone();
                }
                Err(e) => {
                    tracing::warn!(instance_id = %id, "checkpoint not resumable, starting fresh: {}", e);
                    last_error = Some(LastError::new("checkpoint_error", e.to_string()));
                    interpreter = parts.interpreter();
                }
            }
        }

        let failures = parts.router.delivery_failures();
        let publisher = parts.router.publisher(id, last_published);
        let (endpoint, deliveries) = MailboxEndpoint::channel(id, parts.settings.mailbox_capacity);
        let endpoint: Arc<dyn Endpoint> = Arc::new(endpoint);
        parts
            .router
            .attach(id, Arc::clone(&endpoint), checkpoint.as_ref().map(|_| last_processed));
        subscribe(parts);

        let token = lease.token();
        let mut driver = Driver {
            parts,
            snapshot,
            lease,
            interpreter,
            publisher,
            dedupe: Deduplicator::from_watermarks(watermarks),
            timers: TimerSet::new(),
            invocations: Invocations::new(Arc::clone(&parts.services), parts.settings.max_invocation_timeout),
            endpoint,
            deliveries,
            failures,
            failures_open: true,
            last_processed,
            last_error,
            counted_as: None,
        };
        driver.snapshot.send_modify(|s| {
            s.phase = Phase::Running;
            s.lease_token = Some(token);
        });

        match restored {
            Some(effects) => {
                for effect in effects {
                    driver.execute(effect);
                }
                // The answers to these went down with the previous owner.
                for request in interrupted {
                    tracing::warn!(
                        instance_id = %id,
                        "invocation {} of '{}' was in flight at the last checkpoint, failing it",
                        request.id,
                        request.service
                    );
                    let completion = Completion {
                        request,
                        outcome: Err(InvocationFailure::Aborted {
                            message: "interrupted before an answer arrived".to_string(),
                        }),
                        elapsed: Duration::ZERO,
                    };
                    driver.complete(completion).await;
                }
            }
            None => {
                match driver.interpreter.start() {
                    Ok(report) => driver.apply(report),
                    Err(fault) => driver.fail(fault),
                }
                driver.persist();
            }
        }
        driver.report().await;
        driver
    }

    async fn run(&mut self, shutdown: &mut broadcast::Receiver<()>) -> SupervisorExit {
        loop {
            if self.interpreter.status().is_terminal() {
                return self.park(shutdown).await;
            }

            tokio::select! {
                biased;

                _ = shutdown.recv() => return SupervisorExit::Shutdown,
                _ = self.lease.revoked() => {
                    tracing::warn!(instance_id = %self.parts.instance_id, "lease lost, yielding instance");
                    return SupervisorExit::LeaseLost;
                }
                event = self.timers.fired() => self.step(event).await,
                completion = self.invocations.next() => self.complete(completion).await,
                failure = self.failures.recv(), if self.failures_open => match failure {
                    Ok(failure) => self.on_delivery_failure(failure).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(instance_id = %self.parts.instance_id, "missed {} delivery failure notice(s)", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => self.failures_open = false,
                },
                delivery = self.deliveries.recv() => match delivery {
                    Some(delivery) => self.deliver(delivery).await,
                    None => {
                        tracing::warn!(instance_id = %self.parts.instance_id, "inbox taken over, stopping");
                        return SupervisorExit::Detached;
                    }
                },
            }
        }
    }

    /// Keeps a completed or failed instance's lease until shutdown, so no
    /// other node picks it up again.
    async fn park(&mut self, shutdown: &mut broadcast::Receiver<()>) -> SupervisorExit {
        self.timers.clear();
        self.invocations.abort_all();
        self.parts.router.remove_instance(&self.parts.instance_id);
        self.snapshot.send_modify(|s| s.phase = Phase::Parked);
        tracing::info!(
            instance_id = %self.parts.instance_id,
            "instance {}, holding its lease until shutdown",
            self.interpreter.status().as_str()
        );

        tokio::select! {
            biased;
            _ = shutdown.recv() => SupervisorExit::Shutdown,
            _ = self.lease.revoked() => SupervisorExit::LeaseLost,
        }
    }

    async fn close(self, exit: SupervisorExit) {
        let id = self.parts.instance_id.as_str();
        self.parts.router.detach_endpoint(id, &self.endpoint);
        if let Some(status) = self.counted_as {
            self.parts.metrics.instances.with_label_values(&[status.as_str()]).dec();
        }
        match exit {
            SupervisorExit::Shutdown => {
                if let Err(e) = self.parts.coordination.deregister(id).await {
                    tracing::debug!(instance_id = %id, "deregister on shutdown failed: {}", e);
                }
                self.lease.release();
            }
            SupervisorExit::LeaseLost => self.parts.metrics.leases_lost_total.inc(),
            SupervisorExit::Detached => self.lease.release(),
        }
    }

    /// Runs one macro-step, then checkpoints and reports. The registry sees
    /// the instance as processing while the step runs.
    async fn step(&mut self, event: Event) {
        if !self.lease.is_valid() {
            tracing::debug!(instance_id = %self.parts.instance_id, "lease gone, not processing '{}'", event.name);
            return;
        }
        let mut processing = self.status_report();
        processing.status = Status::Processing;
        self.publish_report(processing).await;

        let timer = self
            .parts
            .metrics
            .step_duration
            .with_label_values(&[&self.parts.instance_id])
            .start_timer();
        match self.interpreter.process(event) {
            Ok(report) => self.apply(report),
            Err(fault) => self.fail(fault),
        }
        timer.observe_duration();
        self.persist();
        self.report().await;
    }

    fn apply(&mut self, report: StepReport) {
        let id = self.parts.instance_id.as_str();
        let metrics = &self.parts.metrics;
        metrics.events_processed_total.with_label_values(&[id]).inc();
        if report.discarded {
            metrics.events_discarded_total.with_label_values(&[id]).inc();
        }
        for fault in &report.faults {
            metrics.evaluation_errors_total.with_label_values(&[id]).inc();
            self.last_error = Some(LastError::new(
                "evaluation_error",
                format!("{}: {}", fault.location, fault.error),
            ));
        }
        for transition in &report.fired {
            tracing::debug!(instance_id = %id, "fired {}", transition.label);
        }
        for effect in report.effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Publish(event) => {
                let Some(scope) = scope_for(event.channel) else {
                    return;
                };
                let sequence = self.publisher.publish(event.name.clone(), event.payload, scope);
                self.parts
                    .metrics
                    .events_published_total
                    .with_label_values(&[&self.parts.instance_id])
                    .inc();
                tracing::debug!(
                    instance_id = %self.parts.instance_id,
                    "published '{}' #{}",
                    event.name,
                    sequence
                );
            }
            Effect::Invoke(request) => self.invocations.spawn(request),
            Effect::StartTimer(request) => self.timers.start(request),
            Effect::CancelTimer(key) => {
                self.timers.cancel(&key);
            }
        }
    }

    fn fail(&mut self, fault: FatalInterpreterFault) {
        tracing::error!(instance_id = %self.parts.instance_id, "instance failed: {}", fault);
        self.last_error = Some(LastError::new("fatal_interpreter_fault", fault.reason));
        self.timers.clear();
        self.invocations.abort_all();
    }

    async fn complete(&mut self, completion: Completion) {
        let service = completion.request.service.as_str();
        let outcome = match &completion.outcome {
            Ok(_) => "ok",
            Err(failure) => failure.kind(),
        };
        let metrics = &self.parts.metrics;
        metrics.invocations_total.with_label_values(&[service, outcome]).inc();
        metrics
            .invocation_duration
            .with_label_values(&[service])
            .observe(completion.elapsed.as_secs_f64());

        if let Err(failure) = &completion.outcome {
            tracing::warn!(
                instance_id = %self.parts.instance_id,
                "invocation {} of '{}' failed: {}",
                completion.request.id,
                service,
                failure
            );
            self.last_error = Some(LastError::new(
                "invocation_failure",
                format!("{} ({}): {}", service, completion.request.id, failure),
            ));
        }
        let event = completion.to_event();
        self.step(event).await;
    }

    async fn deliver(&mut self, delivery: Delivery) {
        self.last_processed = self.last_processed.max(delivery.inbox_sequence);
        if !self.dedupe.admit(&delivery.event) {
            self.parts
                .metrics
                .events_duplicate_total
                .with_label_values(&[&self.parts.instance_id])
                .inc();
            tracing::debug!(
                instance_id = %self.parts.instance_id,
                "dropping duplicate '{}' #{} from {}",
                delivery.event.name,
                delivery.event.sequence_number,
                delivery.event.source_instance_id
            );
            let last_processed = self.last_processed;
            self.snapshot
                .send_modify(|s| s.report.last_processed_sequence_number = last_processed);
            return;
        }
        self.step(delivery.into_event()).await;
    }

    async fn on_delivery_failure(&mut self, failure: DeliveryFailure) {
        let id = self.parts.instance_id.as_str();
        let published_here = failure.event.source_instance_id == id;
        if !published_here && failure.target != id {
            return;
        }
        if published_here {
            self.parts.metrics.delivery_failures_total.inc();
        }
        tracing::warn!(
            instance_id = %id,
            "'{}' #{} to {} dropped after {} attempt(s): {}",
            failure.event.name,
            failure.event.sequence_number,
            failure.target,
            failure.attempts,
            failure.error
        );
        self.last_error = Some(LastError::new(
            "delivery_failure",
            format!(
                "'{}' #{} from {} to {}: {}",
                failure.event.name, failure.event.sequence_number, failure.event.source_instance_id, failure.target, failure.error
            ),
        ));
        self.report().await;
    }

    fn persist(&mut self) {
        let Some(store) = &self.parts.store else {
            return;
        };
        if !self.lease.is_valid() {
            tracing::warn!(instance_id = %self.parts.instance_id, "lease gone, checkpoint skipped");
            return;
        }
        let checkpoint = self
            .interpreter
            .checkpoint()
            .with_delivery(
                self.last_processed,
                self.dedupe.watermarks().clone(),
                self.publisher.last_sequence(),
            )
            .with_pending_invocations(self.invocations.pending());
        match store.save(&checkpoint) {
            Ok(meta) => {
                self.parts.metrics.checkpoints_total.inc();
                tracing::trace!(
                    instance_id = %self.parts.instance_id,
                    "checkpoint #{} ({} bytes)",
                    meta.generation,
                    meta.size_bytes
                );
            }
            Err(e) => {
                self.parts.metrics.checkpoint_errors_total.inc();
                tracing::error!(instance_id = %self.parts.instance_id, "checkpoint failed: {}", e);
                self.last_error = Some(LastError::new("checkpoint_error", e.to_string()));
            }
        }
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            status: self.interpreter.status(),
            last_error: self.last_error.clone(),
            last_processed_sequence_number: self.last_processed,
            configuration: self.interpreter.active_paths(),
        }
    }

    async fn report(&mut self) {
        let report = self.status_report();
        self.publish_report(report).await;
    }

    /// Publishes a status locally and to the registry.
    async fn publish_report(&mut self, report: StatusReport) {
        let status = report.status;
        if self.counted_as != Some(status) {
            let instances = &self.parts.metrics.instances;
            if let Some(previous) = self.counted_as {
                instances.with_label_values(&[previous.as_str()]).dec();
            }
            instances.with_label_values(&[status.as_str()]).inc();
            self.counted_as = Some(status);
        }
        self.snapshot.send_modify(|s| s.report = report.clone());

        let metadata = match serde_json::to_value(&report) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::error!(instance_id = %self.parts.instance_id, "status not serializable: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .parts
            .coordination
            .register(&self.parts.instance_id, metadata)
            .await
        {
            tracing::warn!(instance_id = %self.parts.instance_id, "status report failed: {}", e);
        }
    }
}

fn subscribe(parts: &SupervisorParts) {
    let id = parts.instance_id.as_str();
    let patterns = if parts.settings.subscriptions.is_empty() {
        default_subscriptions(&parts.model)
    } else {
        parts.settings.subscriptions.clone()
    };
    let existing = parts.router.subscriptions_of(id);
    for pattern in patterns {
        if existing.contains(&pattern) {
            continue;
        }
        match parts.router.subscribe(id, &pattern) {
            Ok(handle) => tracing::debug!(instance_id = %id, "subscribed to {}", handle.pattern),
            Err(e) => tracing::warn!(instance_id = %id, "cannot subscribe to '{}': {}", pattern, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{from_fn, ServiceImplementation};
    use csmr_coord::{LocalCoordinator, MembershipEvent, Session};
    use csmr_protocol::TargetScope;
    use csmr_router::RouterConfig;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    const COUNTER: &str = r#"
name: counter
variables:
  count: { type: int, initial: 0 }
states:
  - { id: init, kind: initial, transitions: [{ target: Idle }] }
  - id: Idle
    transitions:
      - { event: start, target: Running, actions: [{ assign: "count := 0" }] }
  - id: Running
    transitions:
      - { event: tick, target: Running, guard: "count < 3", actions: [{ assign: "count := count + 1" }] }
      - { event: tick, target: Done, guard: "count >= 3" }
  - { id: Done, kind: final }
"#;

    const QUOTER: &str = r#"
name: quoter
variables:
  price: { type: int, initial: 0 }
  failures: { type: int, initial: 0 }
states:
  - { id: init, kind: initial, transitions: [{ target: Idle }] }
  - id: Idle
    transitions:
      - event: quote
        target: Waiting
        actions: [{ invoke: { service: pricing, input: "$", timeout_ms: 200 } }]
  - id: Waiting
    transitions:
      - event: done.invoke.pricing
        target: Idle
        actions:
          - { assign: "price := $.price" }
          - { raise: { event: quoted, channel: external, payload: "price" } }
      - { event: error.invoke.pricing, target: Idle, actions: [{ assign: "failures := failures + 1" }] }
"#;

    const BEACON: &str = r#"
name: beacon
variables:
  beats: { type: int, initial: 0 }
states:
  - { id: init, kind: initial, transitions: [{ target: Beating }] }
  - id: Beating
    after: [{ name: pulse, delay_ms: 100, event: beat, repeat: true }]
    transitions:
      - { event: beat, guard: "beats < 2", actions: [{ assign: "beats := beats + 1" }] }
      - { event: beat, guard: "beats >= 2", target: Done }
  - { id: Done, kind: final }
"#;

    const DIVIDER: &str = r#"
name: divider
variables:
  result: { type: int, initial: 0 }
states:
  - { id: init, kind: initial, transitions: [{ target: Ready }] }
  - id: Ready
    transitions:
      - { event: divide, actions: [{ assign: "result := 100 / $.by" }] }
"#;

    struct Harness {
        _dir: TempDir,
        router: Arc<EventRouter>,
        coordinator: LocalCoordinator,
        store: Arc<CheckpointStore>,
        services: Arc<ServiceRegistry>,
        metrics: Arc<Metrics>,
        shutdown: broadcast::Sender<()>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
            let (shutdown, _) = broadcast::channel(4);
            Self {
                _dir: dir,
                router: Arc::new(EventRouter::new(RouterConfig::new("test"))),
                coordinator: LocalCoordinator::new(),
                store,
                services: Arc::new(ServiceRegistry::new()),
                metrics: Arc::new(Metrics::new().unwrap()),
                shutdown,
            }
        }

        fn session(&self, node: &str) -> Arc<Session> {
            let session = Arc::new(self.coordinator.open_session(node, Duration::from_secs(5)));
            session.spawn_keepalive(Duration::from_secs(1));
            session
        }

        fn supervisor(&self, yaml: &str, session: Arc<Session>) -> Supervisor {
            let model = Arc::new(Model::from_yaml(yaml).unwrap());
            Supervisor::new(SupervisorParts {
                instance_id: model.name().to_string(),
                model,
                router: self.router.clone(),
                coordination: session,
                store: Some(self.store.clone()),
                services: self.services.clone(),
                metrics: self.metrics.clone(),
                settings: SupervisorSettings {
                    lease_retry_interval: Duration::from_millis(200),
                    ..SupervisorSettings::default()
                },
            })
        }

        fn spawn(&self, supervisor: Supervisor) -> JoinHandle<Result<SupervisorExit, RuntimeError>> {
            tokio::spawn(supervisor.run(self.shutdown.subscribe()))
        }

        fn context(&self, instance: &str, variable: &str) -> Value {
            let checkpoint = self.store.load_latest(instance).unwrap().unwrap();
            checkpoint.context.get(variable).cloned().unwrap_or(Value::Null)
        }
    }

    async fn wait_for(
        watch: &mut watch::Receiver<InstanceSnapshot>,
        f: impl FnMut(&InstanceSnapshot) -> bool,
    ) -> InstanceSnapshot {
        tokio::time::timeout(Duration::from_secs(30), watch.wait_for(f))
            .await
            .expect("timed out waiting for supervisor")
            .expect("supervisor gone")
            .clone()
    }

    fn driver(router: &Arc<EventRouter>) -> Publisher {
        router.publisher("driver", 0)
    }

    #[tokio::test]
    async fn test_counter_runs_to_completion() {
        let h = Harness::new();
        let supervisor = h.supervisor(COUNTER, h.session("n1"));
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);

        wait_for(&mut watch, |s| s.phase == Phase::Running).await;
        let events = driver(&h.router);
        for name in ["start", "tick", "tick", "tick", "tick"] {
            events.publish(name, Value::Null, TargetScope::Subscribers);
        }

        let snapshot = wait_for(&mut watch, |s| s.phase == Phase::Parked).await;
        assert_eq!(snapshot.report.status, Status::Completed);
        assert_eq!(snapshot.report.configuration, vec!["Done"]);
        assert_eq!(snapshot.report.last_processed_sequence_number, 5);
        assert_eq!(h.context("counter", "count"), json!(3));

        let member = h
            .coordinator
            .members()
            .into_iter()
            .find(|m| m.instance_id == "counter")
            .unwrap();
        assert_eq!(member.metadata["status"], "completed");
        assert_eq!(member.metadata["configuration"], json!(["Done"]));

        h.shutdown.send(()).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), SupervisorExit::Shutdown);
        assert!(h.coordinator.members().is_empty());
        assert!(h.coordinator.lock_holder("instance/counter").is_none());
    }

    #[tokio::test]
    async fn test_restart_resumes_from_checkpoint() {
        let h = Harness::new();
        let session = h.session("n1");
        let supervisor = h.supervisor(COUNTER, session.clone());
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        wait_for(&mut watch, |s| s.phase == Phase::Running).await;

        let events = driver(&h.router);
        events.publish("start", Value::Null, TargetScope::Subscribers);
        events.publish("tick", Value::Null, TargetScope::Subscribers);
        wait_for(&mut watch, |s| s.report.last_processed_sequence_number == 2).await;
        h.shutdown.send(()).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), SupervisorExit::Shutdown);

        let supervisor = h.supervisor(COUNTER, session);
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        let snapshot = wait_for(&mut watch, |s| s.phase == Phase::Running).await;
        assert_eq!(snapshot.report.configuration, vec!["Running"]);
        assert_eq!(snapshot.report.last_processed_sequence_number, 2);
        assert_eq!(h.context("counter", "count"), json!(1));

        for _ in 0..3 {
            events.publish("tick", Value::Null, TargetScope::Subscribers);
        }
        let snapshot = wait_for(&mut watch, |s| s.report.status == Status::Completed).await;
        assert_eq!(snapshot.report.configuration, vec!["Done"]);
        assert_eq!(h.context("counter", "count"), json!(3));

        h.shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_owner_hands_over_after_expiry() {
        let h = Harness::new();
        let _reaper = h.coordinator.spawn_reaper(Duration::from_millis(100));

        let session_a = Arc::new(h.coordinator.open_session("node-a", Duration::from_secs(5)));
        let keepalive_a = session_a.spawn_keepalive(Duration::from_secs(1));
        let a = h.supervisor(COUNTER, session_a);
        let mut watch_a = a.watch();
        let handle_a = h.spawn(a);
        let first = wait_for(&mut watch_a, |s| s.phase == Phase::Running).await;

        let events = driver(&h.router);
        events.publish("start", Value::Null, TargetScope::Subscribers);
        events.publish("tick", Value::Null, TargetScope::Subscribers);
        wait_for(&mut watch_a, |s| s.report.last_processed_sequence_number == 2).await;

        let b = h.supervisor(COUNTER, h.session("node-b"));
        let mut watch_b = b.watch();
        let handle_b = h.spawn(b);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(watch_b.borrow().phase, Phase::Waiting);

        handle_a.abort();
        keepalive_a.abort();

        let snapshot = wait_for(&mut watch_b, |s| s.phase == Phase::Running).await;
        assert_eq!(snapshot.report.configuration, vec!["Running"]);
        assert!(snapshot.lease_token > first.lease_token);

        for _ in 0..3 {
            events.publish("tick", Value::Null, TargetScope::Subscribers);
        }
        let snapshot = wait_for(&mut watch_b, |s| s.report.status == Status::Completed).await;
        assert_eq!(snapshot.report.configuration, vec!["Done"]);
        assert_eq!(h.context("counter", "count"), json!(3));

        h.shutdown.send(()).unwrap();
        assert_eq!(handle_b.await.unwrap().unwrap(), SupervisorExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_stops_driving() {
        let h = Harness::new();
        let _reaper = h.coordinator.spawn_reaper(Duration::from_millis(100));
        let session = Arc::new(h.coordinator.open_session("n1", Duration::from_secs(5)));
        let supervisor = h.supervisor(COUNTER, session);
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        wait_for(&mut watch, |s| s.phase == Phase::Running).await;

        assert_eq!(handle.await.unwrap().unwrap(), SupervisorExit::LeaseLost);
        assert_eq!(h.metrics.leases_lost_total.get(), 1.0);
        assert!(h.store.load_latest("counter").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invocation_result_and_failure_events() {
        let h = Harness::new();
        let (observer, mut quoted) = MailboxEndpoint::channel("observer", 8);
        h.router.attach("observer", Arc::new(observer), None);
        h.router.subscribe("observer", "quoted").unwrap();

        let supervisor = h.supervisor(QUOTER, h.session("n1"));
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        wait_for(&mut watch, |s| s.phase == Phase::Running).await;
        let events = driver(&h.router);

        // No implementation registered yet.
        events.publish("quote", json!({ "sku": "a" }), TargetScope::Subscribers);
        let snapshot = wait_for(&mut watch, |s| s.report.last_error.is_some()).await;
        let error = snapshot.report.last_error.unwrap();
        assert_eq!(error.kind, "invocation_failure");
        assert!(error.message.contains("pricing"));
        wait_for(&mut watch, |s| s.report.configuration == vec!["Idle".to_string()]).await;
        assert_eq!(h.context("quoter", "failures"), json!(1));

        h.services.register(
            "pricing",
            ServiceImplementation::new("fixed", from_fn(|_| async { Ok(json!({ "price": 42 })) })),
        );
        events.publish("quote", json!({ "sku": "a" }), TargetScope::Subscribers);
        let delivery = tokio::time::timeout(Duration::from_secs(5), quoted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.event.name, "quoted");
        assert_eq!(delivery.event.payload, json!(42));
        assert_eq!(delivery.event.source_instance_id, "quoter");
        assert_eq!(delivery.event.sequence_number, 1);
        assert_eq!(h.context("quoter", "price"), json!(42));

        h.shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_invocation_fails_after_restart() {
        let h = Harness::new();
        h.services.register(
            "pricing",
            ServiceImplementation::new(
                "stuck",
                from_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }),
            ),
        );
        let quoter = QUOTER.replace("timeout_ms: 200", "timeout_ms: 600000");
        let session = h.session("n1");

        let supervisor = h.supervisor(&quoter, session.clone());
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        wait_for(&mut watch, |s| s.phase == Phase::Running).await;
        driver(&h.router).publish("quote", json!({ "sku": "a" }), TargetScope::Subscribers);
        wait_for(&mut watch, |s| s.report.configuration == vec!["Waiting".to_string()]).await;

        let checkpoint = h.store.load_latest("quoter").unwrap().unwrap();
        assert_eq!(checkpoint.pending_invocations.len(), 1);
        assert_eq!(checkpoint.pending_invocations[0].service, "pricing");
        h.shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let supervisor = h.supervisor(&quoter, session);
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        let snapshot = wait_for(&mut watch, |s| {
            s.phase == Phase::Running && s.report.configuration == vec!["Idle".to_string()]
        })
        .await;
        let error = snapshot.report.last_error.unwrap();
        assert_eq!(error.kind, "invocation_failure");
        assert!(error.message.contains("aborted"), "{}", error.message);
        assert_eq!(h.context("quoter", "failures"), json!(1));
        assert!(h
            .store
            .load_latest("quoter")
            .unwrap()
            .unwrap()
            .pending_invocations
            .is_empty());
        assert_eq!(
            h.metrics
                .invocations_total
                .with_label_values(&["pricing", "aborted"])
                .get(),
            1.0
        );

        h.shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_registry_sees_processing_during_step() {
        let h = Harness::new();
        let session = h.session("n1");
        let mut members = session.watch_membership().await.unwrap();
        let supervisor = h.supervisor(COUNTER, session.clone());
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        wait_for(&mut watch, |s| s.phase == Phase::Running).await;

        driver(&h.router).publish("start", Value::Null, TargetScope::Subscribers);
        wait_for(&mut watch, |s| s.report.configuration == vec!["Running".to_string()]).await;

        let mut reports = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), members.next()).await {
            if let MembershipEvent::Joined(member) | MembershipEvent::Updated(member) = event {
                reports.push((member.metadata["status"].clone(), member.metadata["configuration"].clone()));
            }
        }
        assert_eq!(
            reports,
            vec![
                (json!("idle"), json!(["Idle"])),
                (json!("processing"), json!(["Idle"])),
                (json!("idle"), json!(["Running"])),
            ]
        );

        h.shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_drive_instance() {
        let h = Harness::new();
        let supervisor = h.supervisor(BEACON, h.session("n1"));
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);

        let snapshot = wait_for(&mut watch, |s| s.report.status == Status::Completed).await;
        assert_eq!(snapshot.report.configuration, vec!["Done"]);
        assert_eq!(h.context("beacon", "beats"), json!(2));

        h.shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_evaluation_error_reported_and_instance_survives() {
        let h = Harness::new();
        let supervisor = h.supervisor(DIVIDER, h.session("n1"));
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        wait_for(&mut watch, |s| s.phase == Phase::Running).await;

        let events = driver(&h.router);
        events.publish("divide", json!({ "by": 0 }), TargetScope::Subscribers);
        let snapshot = wait_for(&mut watch, |s| s.report.last_error.is_some()).await;
        assert_eq!(snapshot.report.last_error.unwrap().kind, "evaluation_error");
        assert_eq!(snapshot.report.status, Status::Idle);

        events.publish("divide", json!({ "by": 4 }), TargetScope::Subscribers);
        wait_for(&mut watch, |s| {
            s.report.last_processed_sequence_number == 2 && s.report.status == Status::Idle
        })
        .await;
        assert_eq!(h.context("divider", "result"), json!(25));
        assert_eq!(
            h.metrics
                .evaluation_errors_total
                .with_label_values(&["divider"])
                .get(),
            1.0
        );

        h.shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_redelivered_duplicates_are_ignored() {
        let h = Harness::new();
        let supervisor = h.supervisor(COUNTER, h.session("n1"));
        let mut watch = supervisor.watch();
        let handle = h.spawn(supervisor);
        wait_for(&mut watch, |s| s.phase == Phase::Running).await;

        // The same source sequence number twice, as a retrying peer would send it.
        let start = csmr_protocol::WireEvent::new("start", "driver", 1);
        let tick = csmr_protocol::WireEvent::new("tick", "driver", 2);
        h.router.publish(start, TargetScope::Subscribers);
        h.router.publish(tick.clone(), TargetScope::Subscribers);
        h.router.publish(tick, TargetScope::Subscribers);

        wait_for(&mut watch, |s| s.report.last_processed_sequence_number == 3).await;
        assert_eq!(h.context("counter", "count"), json!(1));
        assert_eq!(
            h.metrics
                .events_duplicate_total
                .with_label_values(&["counter"])
                .get(),
            1.0
        );

        h.shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_default_subscriptions() {
        let model = Model::from_yaml(QUOTER).unwrap();
        assert_eq!(default_subscriptions(&model), vec!["quote"]);
        let model = Model::from_yaml(COUNTER).unwrap();
        assert_eq!(default_subscriptions(&model), vec!["start", "tick"]);
    }

    #[test]
    fn test_status_report_shape() {
        let report = StatusReport {
            status: Status::Idle,
            last_error: Some(LastError::new("delivery_failure", "dropped")),
            last_processed_sequence_number: 9,
            configuration: vec!["Running".to_string()],
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "idle",
                "lastError": { "kind": "delivery_failure", "message": "dropped" },
                "lastProcessedSequenceNumber": 9,
                "configuration": ["Running"],
            })
        );
    }
}
