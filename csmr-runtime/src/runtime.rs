//! Node runtime hosting instance supervisors.

use crate::config::Config;
use crate::error::RuntimeError;
use crate::invoker::ServiceRegistry;
use crate::metrics::Metrics;
use crate::supervisor::{InstanceSnapshot, Supervisor, SupervisorExit, SupervisorParts, SupervisorSettings};
use csmr_coord::Coordination;
use csmr_core::Model;
use csmr_router::EventRouter;
use csmr_storage::CheckpointStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

struct Hosted {
    snapshot: watch::Receiver<InstanceSnapshot>,
    handle: Option<JoinHandle<Result<SupervisorExit, RuntimeError>>>,
}

/// Hosts the instances of one node.
///
/// Each instance gets its own supervisor task. Instances on different nodes
/// with the same id compete for one lease, so at most one of them runs.
pub struct Runtime {
    config: Config,
    router: Arc<EventRouter>,
    coordination: Arc<dyn Coordination>,
    store: Option<Arc<CheckpointStore>>,
    services: Arc<ServiceRegistry>,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Sender<()>,
    instances: Mutex<BTreeMap<String, Hosted>>,
    closing: AtomicBool,
}

impl Runtime {
    pub fn new(
        config: Config,
        router: Arc<EventRouter>,
        coordination: Arc<dyn Coordination>,
        services: Arc<ServiceRegistry>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, RuntimeError> {
        let store = if config.checkpoint.enabled {
            let store = CheckpointStore::open(&config.checkpoint.dir)?.with_retain(config.checkpoint.retain);
            tracing::info!("checkpoints in {}", store.dir().display());
            Some(Arc::new(store))
        } else {
            tracing::warn!("checkpointing disabled, instances restart from scratch");
            None
        };
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config,
            router,
            coordination,
            store,
            services,
            metrics,
            shutdown,
            instances: Mutex::new(BTreeMap::new()),
            closing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Starts supervising an instance of `model`.
    ///
    /// The instance id follows the configured policy. Returns the id.
    pub fn spawn(&self, model: Arc<Model>) -> Result<String, RuntimeError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }
        let instance_id = self
            .config
            .supervisor
            .policy
            .instance_id(model.name(), &self.config.node.node_id);

        let mut instances = self.instances.lock();
        if instances.contains_key(&instance_id) {
            return Err(RuntimeError::DuplicateInstance(instance_id));
        }

        let supervisor = Supervisor::new(SupervisorParts {
            instance_id: instance_id.clone(),
            model,
            router: Arc::clone(&self.router),
            coordination: Arc::clone(&self.coordination),
            store: self.store.clone(),
            services: Arc::clone(&self.services),
            metrics: Arc::clone(&self.metrics),
            settings: SupervisorSettings::from_config(&self.config),
        });
        let snapshot = supervisor.watch();
        let handle = tokio::spawn(supervisor.run(self.shutdown.subscribe()));
        tracing::info!(instance_id = %instance_id, "instance scheduled");

        instances.insert(
            instance_id.clone(),
            Hosted {
                snapshot,
                handle: Some(handle),
            },
        );
        Ok(instance_id)
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.lock().keys().cloned().collect()
    }

    pub fn status(&self, instance_id: &str) -> Option<InstanceSnapshot> {
        self.instances
            .lock()
            .get(instance_id)
            .map(|hosted| hosted.snapshot.borrow().clone())
    }

    pub fn statuses(&self) -> Vec<InstanceSnapshot> {
        self.instances
            .lock()
            .values()
            .map(|hosted| hosted.snapshot.borrow().clone())
            .collect()
    }

    /// Node status as served on `/status`.
    pub fn status_json(&self) -> Value {
        serde_json::json!({
            "node": self.config.node.node_id,
            "instances": self.statuses(),
            "peers": self.router.peers(),
        })
    }

    /// Asks every supervisor to stop. Later [`Runtime::spawn`] calls fail.
    pub fn shutdown(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            tracing::info!("stopping {} instance(s)", self.instances.lock().len());
            let _ = self.shutdown.send(());
        }
    }

    /// Waits for every supervisor task to finish.
    pub async fn join(&self) {
        let handles: Vec<(String, JoinHandle<_>)> = self
            .instances
            .lock()
            .iter_mut()
            .filter_map(|(id, hosted)| hosted.handle.take().map(|h| (id.clone(), h)))
            .collect();

        for (instance_id, handle) in handles {
            match handle.await {
                Ok(Ok(exit)) => tracing::debug!(instance_id = %instance_id, "supervisor exited: {:?}", exit),
                Ok(Err(e)) => tracing::error!(instance_id = %instance_id, "supervisor failed: {}", e),
                Err(e) => tracing::error!(instance_id = %instance_id, "supervisor task panicked: {}", e),
            }
        }
    }
}
