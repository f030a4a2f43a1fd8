// src/cluster/memory.rs
//! In-memory [`ClusterApi`]
//!
//! Keeps hosts, BotRunners and Bots in process memory with small list pages,
//! so pagination, ownership cleanup and watch ordering can be exercised
//! without an API server. Failure injection hooks let tests simulate broken
//! fetches and transport errors.

use crate::cluster::api::{ClusterApi, Page};
use crate::cluster::resources::{Bot, BotRunner};
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::broadcast;

type Key = (String, String);

#[derive(Default)]
struct State {
    pods: BTreeMap<Key, Pod>,
    runners: BTreeMap<Key, BotRunner>,
    bots: BTreeMap<Key, Bot>,
    failing_bots: HashSet<String>,
    fail_next_pod_lists: u32,
    uid_counter: u64,
    version_counter: u64,
    name_counter: u64,
    runner_patches: Vec<(String, Vec<String>)>,
}

impl State {
    fn next_uid(&mut self) -> String {
        self.uid_counter += 1;
        format!("uid-{:06}", self.uid_counter)
    }

    fn next_version(&mut self) -> String {
        self.version_counter += 1;
        self.version_counter.to_string()
    }
}

/// In-memory cluster
pub struct InMemoryCluster {
    state: Mutex<State>,
    runner_events: broadcast::Sender<BotRunner>,
    page_size: usize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_page_size(2)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let (runner_events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            runner_events,
            page_size: page_size.max(1),
        }
    }

    /// Insert or replace a host; a uid is assigned when missing
    pub fn insert_pod(&self, namespace: &str, mut pod: Pod) {
        let mut state = self.state.lock();
        if pod.metadata.uid.is_none() {
            pod.metadata.uid = Some(state.next_uid());
        }
        pod.metadata.namespace = Some(namespace.to_string());
        state.pods.insert((namespace.to_string(), pod.name_any()), pod);
    }

    pub fn insert_bot(&self, namespace: &str, mut bot: Bot) {
        bot.metadata.namespace = Some(namespace.to_string());
        self.state
            .lock()
            .bots
            .insert((namespace.to_string(), bot.name_any()), bot);
    }

    /// Make every fetch of `name` fail with a transient error
    pub fn fail_bot_fetch(&self, name: &str) {
        self.state.lock().failing_bots.insert(name.to_string());
    }

    /// Fail the next `count` host list calls with a transient error
    pub fn fail_next_pod_lists(&self, count: u32) {
        self.state.lock().fail_next_pod_lists = count;
    }

    /// Mark a host as running with one ready container
    pub fn set_pod_ready(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.state.lock();
        match state.pods.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(pod) => {
                pod.status = Some(PodStatus {
                    phase: Some("Running".into()),
                    container_statuses: Some(vec![ContainerStatus {
                        name: "runner".into(),
                        ready: true,
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
                true
            }
            None => false,
        }
    }

    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    pub fn runners(&self, namespace: &str) -> Vec<BotRunner> {
        self.state
            .lock()
            .runners
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, runner)| runner.clone())
            .collect()
    }

    /// Every `spec.bots` patch applied so far, in order
    pub fn runner_patches(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().runner_patches.clone()
    }

    /// Replace a runner's desired bots as an external writer (the controller) would
    pub fn set_desired_bots(&self, namespace: &str, name: &str, bots: &[&str]) -> Result<()> {
        let updated = {
            let mut state = self.state.lock();
            let version = state.next_version();
            let runner = state
                .runners
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| RunnerError::NotFound(format!("botrunners/{}", name)))?;
            runner.spec.bots = bots.iter().map(|b| b.to_string()).collect();
            runner.metadata.resource_version = Some(version);
            runner.clone()
        };
        let _ = self.runner_events.send(updated);
        Ok(())
    }

    fn page<T: Clone>(&self, items: Vec<T>, continue_token: Option<String>) -> Result<Page<T>> {
        let start = match continue_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| RunnerError::ClusterQuery(format!("Invalid continue token '{}'", token)))?,
            None => 0,
        };

        let end = (start + self.page_size).min(items.len());
        let remaining = items.len().saturating_sub(end) as i64;

        Ok(Page {
            items: items.get(start..end).map(<[T]>::to_vec).unwrap_or_default(),
            continue_token: (remaining > 0).then(|| end.to_string()),
            remaining: Some(remaining),
        })
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_pods(&self, namespace: &str, continue_token: Option<String>) -> Result<Page<Pod>> {
        {
            let mut state = self.state.lock();
            if state.fail_next_pod_lists > 0 {
                state.fail_next_pod_lists -= 1;
                return Err(RunnerError::TransientCluster("connection reset".into()));
            }
        }
        self.page(self.pods(namespace), continue_token)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.state
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(format!("pods/{}", name)))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let mut state = self.state.lock();
        let mut pod = pod.clone();

        if pod.metadata.name.is_none() {
            let prefix = pod.metadata.generate_name.clone().ok_or_else(|| {
                RunnerError::ClusterQuery("Pod needs a name or generateName".into())
            })?;
            state.name_counter += 1;
            pod.metadata.name = Some(format!("{}{:05x}", prefix, state.name_counter));
        }

        let key = (namespace.to_string(), pod.name_any());
        if state.pods.contains_key(&key) {
            return Err(RunnerError::ClusterQuery(format!("pods/{} already exists", key.1)));
        }

        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.uid = Some(state.next_uid());
        pod.status = None;
        state.pods.insert(key, pod.clone());
        Ok(pod)
    }

    async fn list_runners(
        &self,
        namespace: &str,
        continue_token: Option<String>,
    ) -> Result<Page<BotRunner>> {
        self.page(self.runners(namespace), continue_token)
    }

    async fn get_runner(&self, namespace: &str, name: &str) -> Result<BotRunner> {
        self.state
            .lock()
            .runners
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(format!("botrunners/{}", name)))
    }

    async fn create_runner(&self, namespace: &str, runner: &BotRunner) -> Result<BotRunner> {
        let created = {
            let mut state = self.state.lock();
            let key = (namespace.to_string(), runner.name_any());
            if state.runners.contains_key(&key) {
                return Err(RunnerError::ClusterQuery(format!(
                    "botrunners/{} already exists",
                    key.1
                )));
            }

            let mut runner = runner.clone();
            runner.metadata.namespace = Some(namespace.to_string());
            runner.metadata.uid = Some(state.next_uid());
            runner.metadata.resource_version = Some(state.next_version());
            state.runners.insert(key, runner.clone());
            runner
        };
        let _ = self.runner_events.send(created.clone());
        Ok(created)
    }

    async fn delete_runner(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .runners
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| RunnerError::NotFound(format!("botrunners/{}", name)))
    }

    async fn patch_runner_bots(
        &self,
        namespace: &str,
        name: &str,
        bots: &[String],
        resource_version: Option<&str>,
    ) -> Result<BotRunner> {
        let updated = {
            let mut state = self.state.lock();
            let version = state.next_version();
            let runner = state
                .runners
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| RunnerError::NotFound(format!("botrunners/{}", name)))?;
            if let Some(expected) = resource_version {
                if runner.metadata.resource_version.as_deref() != Some(expected) {
                    return Err(RunnerError::Conflict(format!(
                        "botrunners/{} is at version {:?}, not {}",
                        name, runner.metadata.resource_version, expected
                    )));
                }
            }
            runner.spec.bots = bots.to_vec();
            runner.metadata.resource_version = Some(version);
            let updated = runner.clone();
            state.runner_patches.push((name.to_string(), bots.to_vec()));
            updated
        };
        let _ = self.runner_events.send(updated.clone());
        Ok(updated)
    }

    async fn get_bot(&self, namespace: &str, name: &str) -> Result<Bot> {
        let state = self.state.lock();
        if state.failing_bots.contains(name) {
            return Err(RunnerError::TransientCluster(format!("bots/{}: connection reset", name)));
        }
        state
            .bots
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(format!("bots/{}", name)))
    }

    fn watch_runner(&self, namespace: &str, name: &str) -> BoxStream<'static, Result<BotRunner>> {
        let receiver = self.runner_events.subscribe();
        let key = (namespace.to_string(), name.to_string());
        let current = self.state.lock().runners.get(&key).cloned();

        let updates = stream::unfold((receiver, key), |(mut receiver, key)| async move {
            loop {
                match receiver.recv().await {
                    Ok(runner) => {
                        let matches = runner.namespace().as_deref() == Some(key.0.as_str())
                            && runner.name_any() == key.1;
                        if matches {
                            return Some((Ok(runner), (receiver, key)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let err = RunnerError::TransientCluster(format!(
                            "watch lagged by {} events",
                            skipped
                        ));
                        return Some((Err(err), (receiver, key)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(current.map(Ok)).chain(updates).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::resources::BotRunnerSpec;
    use kube::api::ObjectMeta;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pagination() {
        let cluster = InMemoryCluster::with_page_size(2);
        for i in 0..5 {
            cluster.insert_pod("ns", pod(&format!("p{}", i)));
        }

        let first = cluster.list_pods("ns", None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.remaining, Some(3));

        let second = cluster.list_pods("ns", first.next_token()).await.unwrap();
        let third = cluster.list_pods("ns", second.next_token()).await.unwrap();
        assert_eq!(third.items.len(), 1);
        assert_eq!(third.next_token(), None);
    }

    #[tokio::test]
    async fn test_generate_name() {
        let cluster = InMemoryCluster::new();
        let mut template = pod("ignored");
        template.metadata.name = None;
        template.metadata.generate_name = Some("runner-".into());

        let created = cluster.create_pod("ns", &template).await.unwrap();
        assert!(created.name_any().starts_with("runner-"));
        assert!(created.metadata.uid.is_some());
    }

    #[tokio::test]
    async fn test_watch_sees_current_then_updates() {
        let cluster = InMemoryCluster::new();
        let runner = BotRunner::new("runner-0", BotRunnerSpec::default());
        cluster.create_runner("ns", &runner).await.unwrap();

        let mut watch = cluster.watch_runner("ns", "runner-0");
        let first = watch.next().await.unwrap().unwrap();
        assert!(first.spec.bots.is_empty());

        cluster.set_desired_bots("ns", "runner-0", &["greeter"]).unwrap();
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!(second.spec.bots, vec!["greeter"]);
    }

    #[tokio::test]
    async fn test_conditional_patch_rejects_stale_version() {
        let cluster = InMemoryCluster::new();
        let runner = BotRunner::new("runner-0", BotRunnerSpec::default());
        let created = cluster.create_runner("ns", &runner).await.unwrap();
        let seen = created.resource_version().unwrap();

        cluster.set_desired_bots("ns", "runner-0", &["greeter", "echo"]).unwrap();

        let stale = cluster
            .patch_runner_bots("ns", "runner-0", &["greeter".to_string()], Some(seen.as_str()))
            .await;
        assert!(matches!(stale, Err(RunnerError::Conflict(_))));
        assert_eq!(
            cluster.get_runner("ns", "runner-0").await.unwrap().spec.bots,
            vec!["greeter", "echo"]
        );

        let current = cluster.get_runner("ns", "runner-0").await.unwrap();
        let patched = cluster
            .patch_runner_bots("ns", "runner-0", &[], current.resource_version().as_deref())
            .await
            .unwrap();
        assert!(patched.spec.bots.is_empty());
        assert_ne!(patched.resource_version(), current.resource_version());
    }
}
