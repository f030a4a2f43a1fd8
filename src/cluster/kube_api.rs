// src/cluster/kube_api.rs
//! [`ClusterApi`] backed by the Kubernetes API server

use crate::cluster::api::{ClusterApi, Page};
use crate::cluster::resources::{Bot, BotRunner};
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

/// Kubernetes-backed cluster client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    page_size: u32,
}

impl KubeCluster {
    pub fn new(client: Client, page_size: u32) -> Self {
        Self { client, page_size }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn try_default(page_size: u32) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| RunnerError::Configuration(format!("Failed to create cluster client: {}", e)))?;

        info!("Connected to cluster API");
        Ok(Self::new(client, page_size))
    }

    fn list_params(&self, continue_token: Option<String>) -> ListParams {
        let mut params = ListParams::default().limit(self.page_size);
        params.continue_token = continue_token;
        params
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn runners(&self, namespace: &str) -> Api<BotRunner> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn bots(&self, namespace: &str) -> Api<Bot> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(&self, namespace: &str, continue_token: Option<String>) -> Result<Page<Pod>> {
        let list = self.pods(namespace).list(&self.list_params(continue_token)).await?;
        Ok(Page {
            items: list.items,
            continue_token: list.metadata.continue_,
            remaining: list.metadata.remaining_item_count,
        })
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self.pods(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn list_runners(
        &self,
        namespace: &str,
        continue_token: Option<String>,
    ) -> Result<Page<BotRunner>> {
        let list = self.runners(namespace).list(&self.list_params(continue_token)).await?;
        Ok(Page {
            items: list.items,
            continue_token: list.metadata.continue_,
            remaining: list.metadata.remaining_item_count,
        })
    }

    async fn get_runner(&self, namespace: &str, name: &str) -> Result<BotRunner> {
        Ok(self.runners(namespace).get(name).await?)
    }

    async fn create_runner(&self, namespace: &str, runner: &BotRunner) -> Result<BotRunner> {
        Ok(self.runners(namespace).create(&PostParams::default(), runner).await?)
    }

    async fn delete_runner(&self, namespace: &str, name: &str) -> Result<()> {
        self.runners(namespace).delete(name, &DeleteParams::default()).await?;
        debug!(namespace, name, "Deleted BotRunner");
        Ok(())
    }

    async fn patch_runner_bots(
        &self,
        namespace: &str,
        name: &str,
        bots: &[String],
        resource_version: Option<&str>,
    ) -> Result<BotRunner> {
        // A resourceVersion in a merge patch is a precondition (409 on mismatch)
        let patch = match resource_version {
            Some(version) => json!({
                "metadata": { "resourceVersion": version },
                "spec": { "bots": bots },
            }),
            None => json!({ "spec": { "bots": bots } }),
        };
        Ok(self
            .runners(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_bot(&self, namespace: &str, name: &str) -> Result<Bot> {
        Ok(self.bots(namespace).get(name).await?)
    }

    fn watch_runner(&self, namespace: &str, name: &str) -> BoxStream<'static, Result<BotRunner>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));

        watcher(self.runners(namespace), config)
            .default_backoff()
            .applied_objects()
            .map_err(RunnerError::from)
            .boxed()
    }
}
