//! # csmr-runtime
//!
//! Node runtime for csmr.
//!
//! This crate provides:
//! - Instance supervisors: lease acquisition, the per-instance event loop,
//!   checkpointing and status reporting
//! - Service invocation with cost-based implementation selection
//! - State timers
//! - Prometheus metrics and the HTTP status endpoint
//! - Node configuration

pub mod config;
pub mod error;
pub mod invoker;
pub mod metrics;
pub mod runtime;
pub mod supervisor;
pub mod timers;

pub use config::{Config, ConfigError, InstancePolicy};
pub use error::RuntimeError;
pub use invoker::{
    from_fn, Completion, InvocationFailure, Invocations, ServiceImplementation, ServiceInvoker, ServiceRegistry,
};
pub use metrics::{run_metrics_server, Metrics, MetricsServer, StatusFn};
pub use runtime::Runtime;
pub use supervisor::{
    InstanceSnapshot, LastError, Phase, StatusReport, Supervisor, SupervisorExit, SupervisorParts, SupervisorSettings,
};
pub use timers::TimerSet;
