// src/cluster/spawner.rs
//! Client host creation on behalf of the controller

use crate::cluster::api::ClusterApi;
use crate::cluster::pods::PodRegistry;
use crate::cluster::resources::{
    host_owner_reference, is_host_ready, HostRole, ANNOTATION_OWNED_BY, ANNOTATION_TYPE,
};
use crate::utils::config::SpawnerConfig;
use crate::utils::errors::{Result, RunnerError};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Creates client hosts and waits for them to become ready
pub struct ClientSpawner {
    cluster: Arc<dyn ClusterApi>,
    registry: PodRegistry,
    config: SpawnerConfig,
}

impl ClientSpawner {
    pub fn new(cluster: Arc<dyn ClusterApi>, registry: PodRegistry, config: SpawnerConfig) -> Self {
        Self {
            cluster,
            registry,
            config,
        }
    }

    /// Create a new client host owned by this (controller) host
    pub async fn spawn_client(&self) -> Result<Pod> {
        let caller = self.registry.current_host().await?;
        if self.registry.role(&caller)? == HostRole::Client {
            return Err(RunnerError::InvariantViolation(
                "Only controllers may spawn clients".into(),
            ));
        }

        let template = self.client_template(&caller)?;
        let namespace = self.registry.namespace();

        let created = self.cluster.create_pod(namespace, &template).await?;
        let name = created.name_any();
        info!(client = %name, owner = %caller.name_any(), "Created client host");

        self.wait_until_ready(&name).await?;
        self.cluster.get_pod(namespace, &name).await
    }

    fn client_template(&self, caller: &Pod) -> Result<Pod> {
        Ok(Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", self.config.app_label)),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    self.config.app_label.clone(),
                )])),
                annotations: Some(BTreeMap::from([
                    (ANNOTATION_TYPE.to_string(), HostRole::Client.as_str().to_string()),
                    (ANNOTATION_OWNED_BY.to_string(), self.registry.host_name().to_string()),
                ])),
                owner_references: Some(vec![host_owner_reference(caller, true)?]),
                ..Default::default()
            },
            spec: caller.spec.clone(),
            status: None,
        })
    }

    /// Poll on a fixed interval until the host is ready or the bound expires
    async fn wait_until_ready(&self, name: &str) -> Result<()> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let deadline = Instant::now() + Duration::from_millis(self.config.ready_timeout_ms);

        loop {
            tokio::time::sleep(interval).await;

            match self.cluster.get_pod(self.registry.namespace(), name).await {
                Ok(pod) if is_host_ready(&pod) => {
                    info!(client = name, "Client host is ready");
                    return Ok(());
                }
                Ok(pod) => {
                    let phase = pod.status.as_ref().and_then(|s| s.phase.clone());
                    debug!(client = name, ?phase, "Client host not ready yet");
                }
                Err(e) if e.is_transient() => {
                    warn!(client = name, error = %e, "Failed to read client host status");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(RunnerError::Timeout(format!(
                    "client host {} not ready after {}ms",
                    name, self.config.ready_timeout_ms
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::utils::retry::RetryPolicy;

    fn host(name: &str, role: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                annotations: Some(BTreeMap::from([(ANNOTATION_TYPE.to_string(), role.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn spawner(cluster: Arc<InMemoryCluster>, me: &str, timeout_ms: u64) -> ClientSpawner {
        let registry = PodRegistry::new(cluster.clone(), "ns", me, RetryPolicy::none());
        ClientSpawner::new(
            cluster,
            registry,
            SpawnerConfig {
                poll_interval_ms: 10,
                ready_timeout_ms: timeout_ms,
                app_label: "botfleet-runner".into(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_waits_for_readiness() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_pod("ns", host("ctrl", "controller"));

        let readiness = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    let pending: Vec<String> = cluster
                        .pods("ns")
                        .iter()
                        .map(|p| p.name_any())
                        .filter(|n| n.starts_with("botfleet-runner-"))
                        .collect();
                    if let Some(name) = pending.first() {
                        cluster.set_pod_ready("ns", name);
                        break;
                    }
                }
            })
        };

        let client = spawner(cluster.clone(), "ctrl", 60_000).spawn_client().await.unwrap();
        readiness.await.unwrap();

        assert!(is_host_ready(&client));
        assert_eq!(client.annotations().get(ANNOTATION_TYPE).map(String::as_str), Some("client"));
        assert_eq!(client.annotations().get(ANNOTATION_OWNED_BY).map(String::as_str), Some("ctrl"));
        assert_eq!(client.labels().get("app").map(String::as_str), Some("botfleet-runner"));
        assert_eq!(client.owner_references()[0].name, "ctrl");
        assert_eq!(client.owner_references()[0].controller, Some(true));
    }

    #[tokio::test]
    async fn test_client_cannot_spawn() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_pod("ns", host("client-a", "client"));

        let result = spawner(cluster.clone(), "client-a", 1_000).spawn_client().await;
        assert!(matches!(result, Err(RunnerError::InvariantViolation(_))));
        assert_eq!(cluster.pods("ns").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_wait_is_bounded() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_pod("ns", host("ctrl", "controller"));

        let result = spawner(cluster, "ctrl", 100).spawn_client().await;
        assert!(matches!(result, Err(RunnerError::Timeout(_))));
    }
}
