//! Node configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CSMR_CONFIG or --config)
//! 3. Environment variables

use csmr_router::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and logging.
    pub node: NodeConfig,
    /// Event routing and the peer listener.
    pub router: RouterSettings,
    /// Sessions and leases.
    pub coordination: CoordinationConfig,
    /// Checkpoint storage.
    pub checkpoint: CheckpointConfig,
    /// Instance hosting.
    pub supervisor: SupervisorConfig,
    /// Service invocation.
    pub invocation: InvocationConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CSMR_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.node.apply_env_overrides();
        self.router.apply_env_overrides();
        self.coordination.apply_env_overrides();
        self.checkpoint.apply_env_overrides();
        self.supervisor.apply_env_overrides();
        self.invocation.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.node_id.trim().is_empty() {
            return Err(ConfigError::ValidationError("node.node_id must not be empty".to_string()));
        }
        self.router.validate()?;
        self.coordination.validate()?;
        if self.supervisor.mailbox_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor.mailbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.invocation.max_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "invocation.max_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.to_lowercase() == "true")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name of this node, unique in the cluster.
    pub node_id: String,
    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("CSMR_NODE_ID") {
            if !id.is_empty() {
                self.node_id = id;
            }
        }
        if let Ok(level) = std::env::var("CSMR_LOG_LEVEL") {
            self.log_level = level;
        }
    }
}

/// Event routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Accept events from peer nodes.
    pub listen: bool,
    /// Address the peer listener binds to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Addresses of peer nodes to forward published events to.
    pub peers: Vec<String>,
    /// Journal entries retained per inbox.
    pub inbox_capacity: usize,
    /// Delivery attempts before an event is dropped.
    pub retry_max_attempts: u32,
    /// First retry delay in milliseconds, doubled per attempt.
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry delay in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Peer connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Peer acknowledgement timeout in milliseconds.
    pub ack_timeout_ms: u64,
    /// Idle peer connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent peer connections.
    pub max_connections: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            listen: false,
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, csmr_protocol::DEFAULT_PORT)),
            peers: Vec::new(),
            inbox_capacity: 1024,
            retry_max_attempts: 5,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 5_000,
            connect_timeout_ms: 5_000,
            ack_timeout_ms: 5_000,
            idle_timeout_secs: 300,
            max_connections: 256,
        }
    }
}

impl RouterSettings {
    fn apply_env_overrides(&mut self) {
        if let Some(listen) = env_flag("CSMR_ROUTER_LISTEN") {
            self.listen = listen;
        }
        if let Some(addr) = env_parse("CSMR_ROUTER_BIND") {
            self.bind_addr = addr;
        }
        if let Ok(peers) = std::env::var("CSMR_ROUTER_PEERS") {
            self.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = env_parse("CSMR_INBOX_CAPACITY") {
            self.inbox_capacity = n;
        }
        if let Some(n) = env_parse("CSMR_RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = n;
        }
        if let Some(ms) = env_parse("CSMR_RETRY_BASE_DELAY_MS") {
            self.retry_base_delay_ms = ms;
        }
        if let Some(ms) = env_parse("CSMR_RETRY_MAX_DELAY_MS") {
            self.retry_max_delay_ms = ms;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.inbox_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "router.inbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "router.retry_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::ValidationError(
                "router.retry_base_delay_ms exceeds router.retry_max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the delivery retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// A session expires when no heartbeat arrived for this long.
    pub session_timeout_ms: u64,
    /// Heartbeat interval, well below the session timeout.
    pub heartbeat_interval_ms: u64,
    /// How often expired sessions are reaped.
    pub reaper_interval_ms: u64,
    /// How often a supervisor retries a lease held elsewhere.
    pub lease_retry_interval_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            reaper_interval_ms: 500,
            lease_retry_interval_ms: 1_000,
        }
    }
}

impl CoordinationConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse("CSMR_SESSION_TIMEOUT_MS") {
            self.session_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("CSMR_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = env_parse("CSMR_REAPER_INTERVAL_MS") {
            self.reaper_interval_ms = ms;
        }
        if let Some(ms) = env_parse("CSMR_LEASE_RETRY_INTERVAL_MS") {
            self.lease_retry_interval_ms = ms;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 || self.reaper_interval_ms == 0 || self.lease_retry_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "coordination intervals must be at least 1ms".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            return Err(ConfigError::ValidationError(format!(
                "coordination.heartbeat_interval_ms ({}) must be below session_timeout_ms ({})",
                self.heartbeat_interval_ms, self.session_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn lease_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lease_retry_interval_ms)
    }
}

/// Checkpoint storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Write a checkpoint after every processed event.
    pub enabled: bool,
    /// Checkpoint directory.
    pub dir: PathBuf,
    /// Checkpoints kept per instance.
    pub retain: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./data/checkpoints"),
            retain: csmr_storage::DEFAULT_RETAIN,
        }
    }
}

impl CheckpointConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("CSMR_CHECKPOINT_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(dir) = std::env::var("CSMR_CHECKPOINT_DIR") {
            self.dir = PathBuf::from(dir);
        }
        if let Some(n) = env_parse("CSMR_CHECKPOINT_RETAIN") {
            self.retain = n;
        }
    }
}

/// How instances of a description are laid out across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePolicy {
    /// One instance per description, named after it, owned by one node at a time.
    #[default]
    Singleton,
    /// One instance per description on every node, named `<description>-<node>`.
    Replicated,
}

impl InstancePolicy {
    /// Instance id of a description's instance hosted on `node_id`.
    pub fn instance_id(&self, description: &str, node_id: &str) -> String {
        match self {
            InstancePolicy::Singleton => description.to_string(),
            InstancePolicy::Replicated => format!("{}-{}", description, node_id),
        }
    }
}

/// Instance hosting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub policy: InstancePolicy,
    /// Event patterns every hosted instance subscribes to. When empty, an
    /// instance subscribes to the events its transitions are triggered by.
    pub subscriptions: Vec<String>,
    /// Deliveries buffered between the router and an instance.
    pub mailbox_capacity: usize,
    /// Bound on micro-steps in one macro-step.
    pub max_microsteps: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            policy: InstancePolicy::Singleton,
            subscriptions: Vec::new(),
            mailbox_capacity: 64,
            max_microsteps: csmr_core::interpreter::DEFAULT_MAX_MICROSTEPS,
        }
    }
}

impl SupervisorConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(policy) = std::env::var("CSMR_INSTANCE_POLICY") {
            match policy.to_lowercase().as_str() {
                "singleton" => self.policy = InstancePolicy::Singleton,
                "replicated" => self.policy = InstancePolicy::Replicated,
                other => tracing::warn!("ignoring unknown CSMR_INSTANCE_POLICY '{}'", other),
            }
        }
        if let Some(n) = env_parse("CSMR_MAILBOX_CAPACITY") {
            self.mailbox_capacity = n;
        }
        if let Some(n) = env_parse("CSMR_MAX_MICROSTEPS") {
            self.max_microsteps = n;
        }
    }
}

/// Service invocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Upper bound on any invocation timeout, in milliseconds.
    pub max_timeout_ms: u64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self { max_timeout_ms: 60_000 }
    }
}

impl InvocationConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse("CSMR_INVOCATION_MAX_TIMEOUT_MS") {
            self.max_timeout_ms = ms;
        }
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("CSMR_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(addr) = env_parse("CSMR_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// SocketAddr as a string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
