// src/cluster/mod.rs
//! Cluster state access
//!
//! Everything the runner knows about hosts and resources comes from here:
//!
//! - **Resources**: `BotRunner` (desired bots per host) and `Bot` definitions
//! - **Api**: the [`ClusterApi`] seam with Kubernetes and in-memory backends
//! - **Pods**: host discovery and role classification
//! - **Runners**: creation, lookup and patching of `BotRunner` resources
//! - **Spawner**: client host creation with a bounded readiness wait

pub mod api;
pub mod kube_api;
pub mod memory;
pub mod pods;
pub mod resources;
pub mod runners;
pub mod spawner;

pub use api::{ClusterApi, Page};
pub use kube_api::KubeCluster;
pub use memory::InMemoryCluster;
pub use pods::PodRegistry;
pub use resources::{Bot, BotCode, BotRunner, BotRunnerSpec, BotSpec, HostRole, RemoteSource};
pub use runners::RunnerResourceStore;
pub use spawner::ClientSpawner;
