// src/context.rs
//! Application context
//!
//! Built once at startup and passed to every component that needs cluster,
//! bus or configuration access.

use crate::cluster::api::ClusterApi;
use crate::cluster::pods::PodRegistry;
use crate::cluster::resources::HostRole;
use crate::cluster::runners::RunnerResourceStore;
use crate::cluster::spawner::ClientSpawner;
use crate::ipc::endpoint::{IpcEndpoint, RequestHandler};
use crate::ipc::message::EndpointId;
use crate::ipc::transport::BusTransport;
use crate::utils::config::RunnerConfig;
use crate::utils::errors::Result;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<RunnerConfig>,
    pub cluster: Arc<dyn ClusterApi>,
    pub bus: Arc<dyn BusTransport>,
    pub host_name: String,
}

impl AppContext {
    pub fn new(
        config: RunnerConfig,
        cluster: Arc<dyn ClusterApi>,
        bus: Arc<dyn BusTransport>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cluster,
            bus,
            host_name: host_name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn pod_registry(&self) -> PodRegistry {
        PodRegistry::new(
            self.cluster.clone(),
            self.namespace(),
            self.host_name.clone(),
            self.config.cluster.retry.clone(),
        )
    }

    pub fn runner_store(&self) -> RunnerResourceStore {
        RunnerResourceStore::new(self.cluster.clone(), self.namespace(), self.config.cluster.retry.clone())
    }

    pub fn client_spawner(&self) -> ClientSpawner {
        ClientSpawner::new(self.cluster.clone(), self.pod_registry(), self.config.spawner.clone())
    }

    pub fn endpoint_id(&self, role: HostRole) -> EndpointId {
        EndpointId::new(&self.host_name, role)
    }

    /// Join the IPC topic as `role`
    pub async fn start_endpoint(&self, role: HostRole, handler: Arc<dyn RequestHandler>) -> Result<IpcEndpoint> {
        IpcEndpoint::start(
            self.endpoint_id(role),
            self.bus.clone(),
            self.config.bus.topic.clone(),
            handler,
            Duration::from_millis(self.config.bus.request_timeout_ms),
        )
        .await
    }
}
