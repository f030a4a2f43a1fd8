// src/cluster/runners.rs
//! BotRunner (desired-state) resource store

use crate::cluster::api::ClusterApi;
use crate::cluster::resources::{
    host_owner_reference, BotRunner, BotRunnerSpec, ANNOTATION_OWNED_BY,
};
use crate::utils::errors::{Result, RunnerError};
use crate::utils::retry::{retry, RetryPolicy};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// CRUD and listing for BotRunner resources
#[derive(Clone)]
pub struct RunnerResourceStore {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    retry: RetryPolicy,
}

impl RunnerResourceStore {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            retry,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// All BotRunners in the namespace, following continuation tokens
    pub async fn find(&self) -> Result<Vec<BotRunner>> {
        let mut runners = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = retry(&self.retry, "list botrunners", || {
                self.cluster.list_runners(&self.namespace, token.clone())
            })
            .await?;

            runners.extend(page.items.iter().cloned());

            match page.next_token() {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(runners)
    }

    /// BotRunners whose `owned-by` annotation names `host_name`
    pub async fn find_owned_by(&self, host_name: &str) -> Result<Vec<BotRunner>> {
        Ok(self
            .find()
            .await?
            .into_iter()
            .filter(|runner| runner.owned_by() == Some(host_name))
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<BotRunner> {
        retry(&self.retry, "read botrunner", || {
            self.cluster.get_runner(&self.namespace, name)
        })
        .await
    }

    /// Create a fresh, empty BotRunner for `host`
    ///
    /// Any resource already owned by a host with the same name is deleted
    /// first, so a restarted host never ends up with two.
    pub async fn create(&self, host: &Pod) -> Result<BotRunner> {
        let host_name = host.name_any();

        for stale in self.find_owned_by(&host_name).await? {
            let stale_name = stale.name_any();
            info!(host = %host_name, runner = %stale_name, "Deleting stale BotRunner");
            match retry(&self.retry, "delete stale botrunner", || {
                self.cluster.delete_runner(&self.namespace, &stale_name)
            })
            .await
            {
                Ok(()) | Err(RunnerError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut owner_references = vec![host_owner_reference(host, true)?];
        owner_references.extend(host.owner_references().iter().cloned().map(|mut owner| {
            owner.controller = Some(false);
            owner
        }));

        let runner = BotRunner {
            metadata: ObjectMeta {
                name: Some(host_name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_OWNED_BY.to_string(),
                    host_name.clone(),
                )])),
                owner_references: Some(owner_references),
                ..Default::default()
            },
            spec: BotRunnerSpec { bots: vec![] },
        };

        let created = retry(&self.retry, "create botrunner", || {
            self.cluster.create_runner(&self.namespace, &runner)
        })
        .await?;

        info!(host = %host_name, runner = %created.name_any(), "Created BotRunner");
        Ok(created)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        retry(&self.retry, "delete botrunner", || {
            self.cluster.delete_runner(&self.namespace, name)
        })
        .await?;
        debug!(runner = name, "Deleted BotRunner");
        Ok(())
    }

    /// Replace `spec.bots`; names are de-duplicated and sorted
    pub async fn patch_bots<I, S>(&self, name: &str, bots: I) -> Result<BotRunner>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write_bots(name, bots, None).await
    }

    /// Replace `spec.bots` only if the resource is still at `resource_version`
    ///
    /// Fails with `Conflict` when someone else wrote in between.
    pub async fn patch_bots_at<I, S>(&self, name: &str, bots: I, resource_version: &str) -> Result<BotRunner>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write_bots(name, bots, Some(resource_version)).await
    }

    async fn write_bots<I, S>(&self, name: &str, bots: I, resource_version: Option<&str>) -> Result<BotRunner>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bots: Vec<String> = bots
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let patched = retry(&self.retry, "patch botrunner", || {
            self.cluster
                .patch_runner_bots(&self.namespace, name, &bots, resource_version)
        })
        .await;

        match &patched {
            Err(RunnerError::Conflict(_)) => {
                debug!(runner = name, "Desired bots changed since they were read, not overwriting")
            }
            Err(e) => warn!(runner = name, error = %e, "Failed to patch desired bots"),
            Ok(_) => {}
        }
        patched
    }
}
