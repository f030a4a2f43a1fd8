// src/utils/config.rs
//! Runner configuration
//!
//! Layers, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. Optional file named by `RUNNER_CONFIG` (toml, yaml or json)
//! 3. `RUNNER__*` environment variables (`RUNNER__BUS__TOPIC=...`)
//! 4. Deployment variables `NAMESPACE`, `KAFKA_BROKERS`, `RUNNER_ENV`, `HOSTNAME`

use crate::runtime::limits::ResourceLimits;
use crate::sandbox::address::CidrBlock;
use crate::utils::errors::{Result, RunnerError};
use crate::utils::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEnv {
    Production,
    #[default]
    Development,
    Testing,
    None,
}

impl RunEnv {
    /// Default log filter for this environment
    pub fn default_log_level(&self) -> &'static str {
        match self {
            RunEnv::Production => "info",
            RunEnv::Development => "debug",
            RunEnv::Testing => "error",
            RunEnv::None => "info",
        }
    }
}

impl FromStr for RunEnv {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "production" => Ok(RunEnv::Production),
            "development" => Ok(RunEnv::Development),
            "testing" | "test" => Ok(RunEnv::Testing),
            "none" => Ok(RunEnv::None),
            other => Err(RunnerError::Configuration(format!(
                "Unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub env: RunEnv,

    /// Namespace holding hosts, BotRunner and Bot resources
    pub namespace: String,

    pub identity: IdentityConfig,
    pub bus: BusConfig,
    pub cluster: ClusterConfig,
    pub spawner: SpawnerConfig,
    pub reconciler: ReconcilerConfig,
    pub sandbox: SandboxSettings,
    pub observability: ObservabilityConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            env: RunEnv::default(),
            namespace: "botfleet".to_string(),
            identity: IdentityConfig::default(),
            bus: BusConfig::default(),
            cluster: ClusterConfig::default(),
            spawner: SpawnerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            sandbox: SandboxSettings::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Host identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name of the host (pod) this process runs in; falls back to the OS host name
    pub host_name: Option<String>,
}

/// Bus transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusTransportKind {
    /// In-process broadcast bus (tests, single-process development)
    #[default]
    Memory,
    /// Kafka brokers (requires the `kafka` feature)
    Kafka,
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub transport: BusTransportKind,

    /// Broker addresses (`host:port`)
    pub brokers: Vec<String>,

    /// Shared control-plane topic
    pub topic: String,

    /// Consumer group prefix; every endpoint joins its own group so it sees all records
    pub group_id: String,

    /// How long a request waits for its response (milliseconds)
    pub request_timeout_ms: u64,

    /// Ship log records to `<topic>-log`
    pub ship_logs: bool,

    /// Bounded wait for brokers at startup
    pub broker_wait: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport: BusTransportKind::default(),
            brokers: vec![],
            topic: "botfleet-runner".to_string(),
            group_id: "botfleet-runner".to_string(),
            request_timeout_ms: 30_000,
            ship_logs: false,
            broker_wait: RetryPolicy {
                max_attempts: 30,
                initial_delay_ms: 500,
                max_delay_ms: 5_000,
                multiplier: 1.5,
                jitter: true,
            },
        }
    }
}

impl BusConfig {
    pub fn log_topic(&self) -> String {
        format!("{}-log", self.topic)
    }
}

/// Cluster API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Page size for list calls
    pub page_size: u32,

    /// Retry policy for individual API calls
    pub retry: RetryPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Client spawn configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// Readiness poll interval (milliseconds)
    pub poll_interval_ms: u64,

    /// Upper bound on the readiness wait (milliseconds)
    pub ready_timeout_ms: u64,

    /// Value of the `app` label and prefix of generated host names
    pub app_label: String,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            ready_timeout_ms: 600_000,
            app_label: "botfleet-runner".to_string(),
        }
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Reconnect policy for the desired-state watch
    pub watch_retry: RetryPolicy,

    /// How long a worker may take to report online (milliseconds)
    pub worker_startup_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL (milliseconds)
    pub worker_kill_grace_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            watch_retry: RetryPolicy {
                max_attempts: 10,
                initial_delay_ms: 500,
                max_delay_ms: 30_000,
                multiplier: 2.0,
                jitter: true,
            },
            worker_startup_timeout_ms: 30_000,
            worker_kill_grace_ms: 2_000,
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Vendor-reserved blocks treated as local in addition to the built-in ranges
    pub blocked_ranges: Vec<CidrBlock>,

    /// Largest single file accepted into a virtual filesystem
    pub max_file_bytes: usize,

    /// Largest total size of a remote source checkout
    pub max_source_bytes: usize,

    /// Most files and directories a remote source checkout may contain
    pub max_source_entries: usize,

    /// Clone depth used when a remote source does not specify one
    pub clone_depth: u32,

    /// git executable; looked up on PATH when unset
    pub git_binary: Option<String>,

    /// Per-worker CPU/memory limits
    pub worker_limits: ResourceLimits,

    /// Command that runs a handler's source, read from its stdin
    pub interpreter: Vec<String>,

    /// Upper bound on a single event handler run (milliseconds); `/main` is unbounded
    pub handler_timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            blocked_ranges: vec![CidrBlock::CARRIER_GRADE_NAT],
            max_file_bytes: 8 * 1024 * 1024,
            max_source_bytes: 64 * 1024 * 1024,
            max_source_entries: 10_000,
            clone_depth: 1,
            git_binary: None,
            worker_limits: ResourceLimits::default(),
            interpreter: vec!["node".to_string(), "-".to_string()],
            handler_timeout_ms: 30_000,
        }
    }
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Force JSON (true) or human-readable (false) logs; defaults by environment
    pub json_logs: Option<bool>,

    /// Prometheus exporter listen address
    pub metrics_addr: Option<SocketAddr>,
}

impl RunnerConfig {
    /// Load configuration from defaults, optional file and process environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&RunnerConfig::default())?);

        if let Ok(path) = std::env::var("RUNNER_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RUNNER")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("bus.brokers")
                .try_parsing(true),
        );

        let mut config: RunnerConfig = builder.build()?.try_deserialize()?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Apply the flat deployment variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(namespace) = lookup("NAMESPACE").filter(|v| !v.is_empty()) {
            self.namespace = namespace;
        }

        if let Some(brokers) = lookup("KAFKA_BROKERS").filter(|v| !v.is_empty()) {
            self.bus.brokers = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(env) = lookup("RUNNER_ENV").filter(|v| !v.is_empty()) {
            self.env = env.parse()?;
        }

        if self.identity.host_name.is_none() {
            self.identity.host_name = lookup("HOSTNAME").filter(|v| !v.is_empty());
        }

        // Configured brokers mean the shared broker is the bus
        if !self.bus.brokers.is_empty() {
            self.bus.transport = BusTransportKind::Kafka;
        }

        Ok(())
    }

    /// Checks that only apply to controller and client hosts
    ///
    /// Hosts run in separate pods, so they need a bus they can all reach. The
    /// in-memory bus is process-local and only allowed in the testing
    /// environment.
    pub fn validate_host(&self) -> Result<()> {
        if self.bus.transport == BusTransportKind::Memory && self.env != RunEnv::Testing {
            return Err(RunnerError::Configuration(format!(
                "the in-memory bus cannot reach other hosts; set bus.brokers or KAFKA_BROKERS (env is {:?})",
                self.env
            )));
        }
        Ok(())
    }

    /// Reject values that would make the runner misbehave
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(RunnerError::Configuration("namespace must not be empty".into()));
        }

        if self.bus.topic.is_empty() {
            return Err(RunnerError::Configuration("bus.topic must not be empty".into()));
        }

        if self.bus.transport == BusTransportKind::Kafka && self.bus.brokers.is_empty() {
            return Err(RunnerError::Configuration(
                "bus.brokers is required for the kafka transport".into(),
            ));
        }

        self.sandbox.worker_limits.validate()?;

        if self.sandbox.interpreter.is_empty() {
            return Err(RunnerError::Configuration(
                "sandbox.interpreter must name a program".into(),
            ));
        }

        if self.spawner.poll_interval_ms == 0 {
            return Err(RunnerError::Configuration(
                "spawner.poll_interval_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Name of the host this process runs in
    pub fn host_name(&self) -> Result<String> {
        if let Some(name) = &self.identity.host_name {
            return Ok(name.clone());
        }

        nix::unistd::gethostname()
            .map_err(|e| RunnerError::Configuration(format!("Failed to read host name: {}", e)))?
            .into_string()
            .map_err(|_| RunnerError::Configuration("Host name is not valid UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.namespace, "botfleet");
        assert_eq!(config.bus.topic, "botfleet-runner");
        assert_eq!(config.bus.log_topic(), "botfleet-runner-log");
        assert_eq!(config.spawner.poll_interval_ms, 10_000);
        assert_eq!(config.env, RunEnv::Development);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RunnerConfig::default();
        config
            .apply_env_overrides(lookup_from(&[
                ("NAMESPACE", "bots"),
                ("KAFKA_BROKERS", "kafka-0:9092, kafka-1:9092,"),
                ("RUNNER_ENV", "production"),
                ("HOSTNAME", "runner-abc"),
            ]))
            .unwrap();

        assert_eq!(config.namespace, "bots");
        assert_eq!(config.bus.brokers, vec!["kafka-0:9092", "kafka-1:9092"]);
        assert_eq!(config.bus.transport, BusTransportKind::Kafka);
        assert_eq!(config.env, RunEnv::Production);
        assert_eq!(config.host_name().unwrap(), "runner-abc");
    }

    #[test]
    fn test_unknown_env_rejected() {
        let mut config = RunnerConfig::default();
        let result = config.apply_env_overrides(lookup_from(&[("RUNNER_ENV", "staging")]));
        assert!(matches!(result, Err(RunnerError::Configuration(_))));
    }

    #[test]
    fn test_kafka_requires_brokers() {
        let mut config = RunnerConfig::default();
        config.bus.transport = BusTransportKind::Kafka;
        assert!(config.validate().is_err());

        config.bus.brokers = vec!["kafka:9092".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interpreter_required() {
        let mut config = RunnerConfig::default();
        config.sandbox.interpreter.clear();
        assert!(matches!(config.validate(), Err(RunnerError::Configuration(_))));
    }

    #[test]
    fn test_hosts_need_a_shared_bus() {
        let mut config = RunnerConfig::default();
        assert!(matches!(config.validate_host(), Err(RunnerError::Configuration(_))));

        config.env = RunEnv::Testing;
        assert!(config.validate_host().is_ok());

        config.env = RunEnv::Production;
        config
            .apply_env_overrides(lookup_from(&[("KAFKA_BROKERS", "kafka-0:9092")]))
            .unwrap();
        assert!(config.validate_host().is_ok());
    }

    #[test]
    fn test_log_levels_by_env() {
        assert_eq!(RunEnv::Testing.default_log_level(), "error");
        assert_eq!(RunEnv::Development.default_log_level(), "debug");
        assert_eq!(RunEnv::Production.default_log_level(), "info");
    }
}
