// src/lib.rs
//! Botfleet Runner Library
//!
//! Runs bot workloads inside a Kubernetes namespace. One controller host
//! makes sure client hosts exist; each client host owns a `BotRunner`
//! resource and keeps one sandboxed worker process running per desired bot.
//!
//! # Architecture
//!
//! - **cluster**: pod registry, `BotRunner`/`Bot` resources, client spawning
//! - **ipc**: request/response messaging over a shared broadcast topic
//! - **sandbox**: virtual filesystem, address filtering, capability handle
//! - **runtime**: controller and client roles, reconciliation, worker processes
//! - **observability**: tracing, log shipping and metrics
//! - **utils**: configuration, errors and retry

pub mod cluster;
pub mod context;
pub mod ipc;
pub mod observability;
pub mod runtime;
pub mod sandbox;
pub mod utils;

// Re-export commonly used types
pub use cluster::{Bot, BotRunner, ClusterApi, HostRole, InMemoryCluster, KubeCluster};
pub use context::AppContext;
pub use ipc::{BusTransport, InMemoryBus, IpcEndpoint};
pub use runtime::{run_client, run_controller, ReconciliationLoop};
pub use sandbox::SandboxRuntime;
pub use utils::config::RunnerConfig;
pub use utils::errors::{Result, RunnerError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Runner build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
