//! Service invocation.
//!
//! Invoke actions name a service; the [`ServiceRegistry`] picks one of the
//! implementations registered under that name and calls it. Calls run off
//! the instance's event loop and their outcome comes back as an internal
//! event.

use async_trait::async_trait;
use csmr_core::{Event, InvocationRequest};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{Id, JoinSet};

/// Why a service call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationFailure {
    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("service unreachable: {message}")]
    Unreachable { message: String },

    #[error("service error {code}: {message}")]
    ApplicationError { code: String, message: String },

    /// The call ended without an answer, e.g. the invoker panicked.
    #[error("invocation aborted: {message}")]
    Aborted { message: String },
}

impl InvocationFailure {
    pub fn unreachable(message: impl Into<String>) -> Self {
        InvocationFailure::Unreachable {
            message: message.into(),
        }
    }

    pub fn application(code: impl Into<String>, message: impl Into<String>) -> Self {
        InvocationFailure::ApplicationError {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InvocationFailure::Timeout { .. } => "timeout",
            InvocationFailure::Unreachable { .. } => "unreachable",
            InvocationFailure::ApplicationError { .. } => "application_error",
            InvocationFailure::Aborted { .. } => "aborted",
        }
    }

    pub fn code(&self) -> &str {
        match self {
            InvocationFailure::Timeout { .. } => "TIMEOUT",
            InvocationFailure::Unreachable { .. } => "UNREACHABLE",
            InvocationFailure::ApplicationError { code, .. } => code,
            InvocationFailure::Aborted { .. } => "ABORTED",
        }
    }

    /// Payload of the error event raised for this failure.
    pub fn to_payload(&self) -> Value {
        let message = match self {
            InvocationFailure::ApplicationError { message, .. } => message.clone(),
            other => other.to_string(),
        };
        json!({
            "kind": self.kind(),
            "code": self.code(),
            "message": message,
        })
    }
}

/// Something that answers service calls.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(&self, service: &str, input: Value) -> Result<Value, InvocationFailure>;
}

/// A service backed by an async closure.
pub struct FnService<F> {
    f: F,
}

/// Wraps an async closure as a [`ServiceInvoker`].
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn ServiceInvoker>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, InvocationFailure>> + Send + 'static,
{
    Arc::new(FnService { f })
}

#[async_trait]
impl<F, Fut> ServiceInvoker for FnService<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, InvocationFailure>> + Send + 'static,
{
    async fn invoke(&self, _service: &str, input: Value) -> Result<Value, InvocationFailure> {
        (self.f)(input).await
    }
}

/// One registered implementation of a service.
#[derive(Clone)]
pub struct ServiceImplementation {
    pub name: String,
    /// Relative cost; cheaper implementations are tried first.
    pub cost: f64,
    /// Runs on this node.
    pub local: bool,
    pub invoker: Arc<dyn ServiceInvoker>,
}

impl ServiceImplementation {
    pub fn new(name: impl Into<String>, invoker: Arc<dyn ServiceInvoker>) -> Self {
        Self {
            name: name.into(),
            cost: 1.0,
            local: true,
            invoker,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn remote(mut self) -> Self {
        self.local = false;
        self
    }
}

impl std::fmt::Debug for ServiceImplementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceImplementation")
            .field("name", &self.name)
            .field("cost", &self.cost)
            .field("local", &self.local)
            .finish()
    }
}

/// Implementations by service name.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Vec<ServiceImplementation>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an implementation of `service`.
    pub fn register(&self, service: impl Into<String>, implementation: ServiceImplementation) {
        let service = service.into();
        tracing::debug!(
            "registered {} for service '{}' (cost {}, local {})",
            implementation.name,
            service,
            implementation.cost,
            implementation.local
        );
        self.services.write().entry(service).or_default().push(implementation);
    }

    /// Removes every implementation of `service`.
    pub fn unregister(&self, service: &str) -> bool {
        self.services.write().remove(service).is_some()
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Eligible implementations of `service`, cheapest first.
    pub fn select(&self, service: &str, local: bool) -> Vec<ServiceImplementation> {
        let mut candidates: Vec<ServiceImplementation> = self
            .services
            .read()
            .get(service)
            .map(|all| all.iter().filter(|i| !local || i.local).cloned().collect())
            .unwrap_or_default();
        candidates.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        candidates
    }

    /// Calls `service`, failing over to the next implementation while the
    /// current one is unreachable.
    pub async fn call(&self, service: &str, input: Value, local: bool) -> Result<Value, InvocationFailure> {
        let candidates = self.select(service, local);
        if candidates.is_empty() {
            return Err(InvocationFailure::unreachable(format!(
                "no {}implementation of '{}'",
                if local { "local " } else { "" },
                service
            )));
        }

        let mut last = None;
        for implementation in candidates {
            match implementation.invoker.invoke(service, input.clone()).await {
                Err(InvocationFailure::Unreachable { message }) => {
                    tracing::warn!(
                        "{} for '{}' unreachable, trying next: {}",
                        implementation.name,
                        service,
                        message
                    );
                    last = Some(InvocationFailure::Unreachable { message });
                }
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| InvocationFailure::unreachable(service)))
    }
}

#[async_trait]
impl ServiceInvoker for ServiceRegistry {
    async fn invoke(&self, service: &str, input: Value) -> Result<Value, InvocationFailure> {
        self.call(service, input, false).await
    }
}

/// Result of one finished invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub request: InvocationRequest,
    pub outcome: Result<Value, InvocationFailure>,
    pub elapsed: Duration,
}

impl Completion {
    /// The internal event raised for this completion.
    pub fn to_event(&self) -> Event {
        match &self.outcome {
            Ok(response) => Event::internal(self.request.done_event.clone()).with_payload(response.clone()),
            Err(failure) => Event::internal(self.request.error_event.clone()).with_payload(failure.to_payload()),
        }
    }
}

/// In-flight invocations of one instance.
///
/// Dropping the set aborts whatever is still running.
pub struct Invocations {
    registry: Arc<ServiceRegistry>,
    max_timeout: Duration,
    running: JoinSet<Completion>,
    /// Requests by task, so a task that dies still produces a completion.
    requests: HashMap<Id, (InvocationRequest, Instant)>,
}

impl Invocations {
    pub fn new(registry: Arc<ServiceRegistry>, max_timeout: Duration) -> Self {
        Self {
            registry,
            max_timeout,
            running: JoinSet::new(),
            requests: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Starts a call. Its timeout is capped at the configured maximum.
    pub fn spawn(&mut self, request: InvocationRequest) {
        let registry = Arc::clone(&self.registry);
        let timeout = if request.timeout.is_zero() {
            self.max_timeout
        } else {
            request.timeout.min(self.max_timeout)
        };
        tracing::debug!("invoking '{}' as {} (timeout {:?})", request.service, request.id, timeout);

        let tracked = request.clone();
        let handle = self.running.spawn(async move {
            let started = Instant::now();
            let call = registry.call(&request.service, request.input.clone(), request.local);
            let outcome = match tokio::time::timeout(timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(InvocationFailure::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            Completion {
                request,
                outcome,
                elapsed: started.elapsed(),
            }
        });
        self.requests.insert(handle.id(), (tracked, Instant::now()));
    }

    /// Requests still waiting for an answer, ordered by id.
    pub fn pending(&self) -> Vec<InvocationRequest> {
        let mut pending: Vec<InvocationRequest> = self.requests.values().map(|(r, _)| r.clone()).collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending
    }

    /// Waits for the next invocation to finish. Pending while none is running.
    ///
    /// A call whose task panicked completes with [`InvocationFailure::Aborted`].
    pub async fn next(&mut self) -> Completion {
        loop {
            match self.running.join_next_with_id().await {
                Some(Ok((id, completion))) => {
                    self.requests.remove(&id);
                    return completion;
                }
                Some(Err(e)) => {
                    let Some((request, started)) = self.requests.remove(&e.id()) else {
                        continue;
                    };
                    if e.is_cancelled() {
                        continue;
                    }
                    tracing::error!("invocation {} of '{}' failed: {}", request.id, request.service, e);
                    return Completion {
                        request,
                        outcome: Err(InvocationFailure::Aborted {
                            message: "service invoker panicked".to_string(),
                        }),
                        elapsed: started.elapsed(),
                    };
                }
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Aborts every running invocation.
    pub fn abort_all(&mut self) {
        self.running.abort_all();
        self.requests.clear();
    }
}
