// src/cluster/pods.rs
//! Host discovery and role classification

use crate::cluster::api::ClusterApi;
use crate::cluster::resources::{host_role, is_annotated, HostRole};
use crate::utils::errors::{Result, RunnerError};
use crate::utils::retry::{retry, RetryPolicy};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::debug;

/// Lists and classifies runner hosts
#[derive(Clone)]
pub struct PodRegistry {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    host_name: String,
    retry: RetryPolicy,
}

impl PodRegistry {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        host_name: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            host_name: host_name.into(),
            retry,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// All hosts carrying the role annotation, following continuation tokens
    pub async fn list_annotated_hosts(&self) -> Result<Vec<Pod>> {
        let mut hosts = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = retry(&self.retry, "list hosts", || {
                self.cluster.list_pods(&self.namespace, token.clone())
            })
            .await?;

            hosts.extend(page.items.iter().filter(|pod| is_annotated(pod)).cloned());

            match page.next_token() {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(count = hosts.len(), namespace = %self.namespace, "Listed annotated hosts");
        Ok(hosts)
    }

    /// Annotated hosts whose role is exactly `role`
    pub async fn list_by_role(&self, role: HostRole) -> Result<Vec<Pod>> {
        Ok(self
            .list_annotated_hosts()
            .await?
            .into_iter()
            .filter(|pod| host_role(pod).map(|r| r == role).unwrap_or(false))
            .collect())
    }

    /// This process's own host record
    pub async fn current_host(&self) -> Result<Pod> {
        retry(&self.retry, "read own host", || {
            self.cluster.get_pod(&self.namespace, &self.host_name)
        })
        .await
        .map_err(|e| {
            RunnerError::Configuration(format!(
                "Failed to read own host {}/{}: {}",
                self.namespace, self.host_name, e
            ))
        })
    }

    pub fn role(&self, host: &Pod) -> Result<HostRole> {
        host_role(host)
    }

    /// Role of this process's own host
    pub async fn current_role(&self) -> Result<HostRole> {
        let host = self.current_host().await?;
        self.role(&host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::resources::ANNOTATION_TYPE;
    use kube::api::ObjectMeta;
    use kube::ResourceExt;
    use std::collections::BTreeMap;

    fn host(name: &str, role: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                annotations: role
                    .map(|r| BTreeMap::from([(ANNOTATION_TYPE.to_string(), r.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn registry(cluster: Arc<InMemoryCluster>, me: &str) -> PodRegistry {
        let policy = RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 1,
            jitter: false,
            ..Default::default()
        };
        PodRegistry::new(cluster, "ns", me, policy)
    }

    #[tokio::test]
    async fn test_lists_across_pages() {
        let cluster = Arc::new(InMemoryCluster::with_page_size(2));
        cluster.insert_pod("ns", host("ctrl", Some("controller")));
        cluster.insert_pod("ns", host("client-a", Some("client")));
        cluster.insert_pod("ns", host("unrelated", None));
        cluster.insert_pod("ns", host("client-b", Some("client")));
        cluster.insert_pod("other", host("elsewhere", Some("client")));

        let registry = registry(cluster, "ctrl");
        let mut names: Vec<String> = registry
            .list_annotated_hosts()
            .await
            .unwrap()
            .iter()
            .map(|p| p.name_any())
            .collect();
        names.sort();
        assert_eq!(names, vec!["client-a", "client-b", "ctrl"]);

        let clients = registry.list_by_role(HostRole::Client).await.unwrap();
        assert_eq!(clients.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_list_failures_are_retried() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_pod("ns", host("ctrl", Some("controller")));
        cluster.fail_next_pod_lists(2);

        let hosts = registry(cluster, "ctrl").list_annotated_hosts().await.unwrap();
        assert_eq!(hosts.len(), 1);
    }

    #[tokio::test]
    async fn test_current_role() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_pod("ns", host("ctrl", Some("controller")));
        cluster.insert_pod("ns", host("weird", Some("sidecar")));

        assert_eq!(
            registry(cluster.clone(), "ctrl").current_role().await.unwrap(),
            HostRole::Controller
        );
        assert!(matches!(
            registry(cluster.clone(), "weird").current_role().await,
            Err(RunnerError::Configuration(_))
        ));
        assert!(matches!(
            registry(cluster, "missing").current_host().await,
            Err(RunnerError::Configuration(_))
        ));
    }
}
