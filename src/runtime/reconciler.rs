// src/runtime/reconciler.rs
//! Client-side reconciliation loop
//!
//! Watches this host's BotRunner and converges the set of running workers
//! to its `spec.bots`:
//!
//! 1. bots running but no longer desired are stopped first
//! 2. newly desired bots are fetched, sandboxed and launched concurrently
//! 3. once every start has settled, `spec.bots` is patched to exactly the
//!    bots that are running, so failed starts drop out of desired state
//!
//! The write-back is conditional on the resourceVersion the pass was based
//! on. If the desired state moved on in the meantime the write is skipped and
//! the newer state is reconciled from its own event. Events already queued
//! behind the one being handled are collapsed to the newest.
//!
//! Desired-state events and worker exits are handled by the loop task only,
//! one at a time, so the worker map never sees concurrent mutation.

use crate::cluster::api::ClusterApi;
use crate::cluster::resources::{BotRunner, API_VERSION};
use crate::cluster::runners::RunnerResourceStore;
use crate::ipc::endpoint::RunningBots;
use crate::runtime::worker::{LaunchRequest, Worker, WorkerExit, WorkerLauncher};
use crate::sandbox::runtime::SandboxRuntime;
use crate::utils::config::ReconcilerConfig;
use crate::utils::errors::{Result, RunnerError};
use crate::utils::retry::{retry, RetryPolicy};
use futures::future::join_all;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use kube::ResourceExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one reconciliation pass did
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub removed: Vec<String>,
    pub started: Vec<String>,
    pub failed: Vec<(String, RunnerError)>,
    /// The bots written back to desired state, if a patch was made
    pub patched: Option<Vec<String>>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.started.is_empty() && self.failed.is_empty()
    }
}

pub struct ReconciliationLoop {
    cluster: Arc<dyn ClusterApi>,
    store: RunnerResourceStore,
    runner_name: String,
    sandbox: Arc<SandboxRuntime>,
    launcher: Arc<dyn WorkerLauncher>,
    running: RunningBots,
    config: ReconcilerConfig,
    fetch_retry: RetryPolicy,
    workers: HashMap<String, Worker>,
    next_instance: u64,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
}

impl ReconciliationLoop {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: RunnerResourceStore,
        runner_name: impl Into<String>,
        sandbox: Arc<SandboxRuntime>,
        launcher: Arc<dyn WorkerLauncher>,
        running: RunningBots,
        config: ReconcilerConfig,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            cluster,
            store,
            runner_name: runner_name.into(),
            sandbox,
            launcher,
            running,
            config,
            fetch_retry: RetryPolicy::none(),
            workers: HashMap::new(),
            next_instance: 0,
            exits_tx,
            exits_rx,
        }
    }

    /// Retry transient Bot fetch failures before giving up on a start
    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    /// Bots with a live worker, sorted
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Converge the running workers to `desired`, writing back unconditionally
    pub async fn apply(&mut self, desired: &BTreeSet<String>) -> ReconcileOutcome {
        self.converge(desired, None).await
    }

    /// Converge to an observed BotRunner; the write-back only lands if the
    /// resource is still at the observed version
    pub async fn apply_observed(&mut self, runner: &BotRunner) -> ReconcileOutcome {
        let version = runner.resource_version();
        self.converge(&runner.spec.bot_set(), version.as_deref()).await
    }

    async fn converge(&mut self, desired: &BTreeSet<String>, resource_version: Option<&str>) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        let to_remove: Vec<String> = self
            .workers
            .keys()
            .filter(|name| !desired.contains(*name))
            .cloned()
            .collect();
        let to_add: Vec<String> = desired
            .iter()
            .filter(|name| !self.workers.contains_key(*name))
            .cloned()
            .collect();

        if to_remove.is_empty() && to_add.is_empty() {
            debug!(runner = %self.runner_name, "Desired state already converged");
            return outcome;
        }

        info!(runner = %self.runner_name, remove = ?to_remove, add = ?to_add, "Reconciling bots");

        // Removals go first to free capacity
        let mut stopping = Vec::new();
        for name in &to_remove {
            if let Some(worker) = self.workers.remove(name) {
                self.running.remove(name);
                stopping.push(worker.terminate());
            }
        }
        join_all(stopping).await;
        outcome.removed = to_remove;

        let starts: Vec<(String, u64)> = to_add
            .into_iter()
            .map(|name| {
                self.next_instance += 1;
                (name, self.next_instance)
            })
            .collect();

        let results = join_all(
            starts
                .iter()
                .map(|(name, instance)| self.start_bot(name, *instance)),
        )
        .await;

        for ((name, _), result) in starts.into_iter().zip(results) {
            match result {
                Ok(worker) => {
                    metrics::counter!("runner_worker_starts_total").increment(1);
                    self.running.insert(name.clone());
                    self.workers.insert(name.clone(), worker);
                    outcome.started.push(name);
                }
                Err(e) => {
                    metrics::counter!("runner_worker_start_failures_total").increment(1);
                    warn!(bot = %name, error = %e, "Bot failed to start, dropping it from desired state");
                    outcome.failed.push((name, e));
                }
            }
        }

        metrics::gauge!("runner_workers_running").set(self.workers.len() as f64);

        let running = self.running();
        let written = match resource_version {
            Some(version) => {
                self.store
                    .patch_bots_at(&self.runner_name, running.clone(), version)
                    .await
            }
            None => self.store.patch_bots(&self.runner_name, running.clone()).await,
        };
        match written {
            Ok(_) => outcome.patched = Some(running),
            Err(RunnerError::Conflict(_)) => {
                info!(runner = %self.runner_name, "Desired state changed during reconciliation, deferring to the newer state")
            }
            Err(e) => error!(runner = %self.runner_name, error = %e, "Failed to write back desired bots"),
        }

        outcome
    }

    async fn start_bot(&self, name: &str, instance: u64) -> Result<Worker> {
        let namespace = self.store.namespace();

        let bot = retry(&self.fetch_retry, "fetch bot", || self.cluster.get_bot(namespace, name))
            .await
            .map_err(|e| RunnerError::bot_startup(name, e))?;

        let fs = self
            .sandbox
            .build_filesystem(&bot.spec)
            .await
            .map_err(|e| RunnerError::bot_startup(name, e))?;

        let request = LaunchRequest {
            bot: name.to_string(),
            namespace: namespace.to_string(),
            api_version: API_VERSION.to_string(),
            instance,
            snapshot: fs.snapshot(),
        };

        self.launcher.launch(request, self.exits_tx.clone()).await
    }

    /// Forget a worker that exited; exits of replaced instances are ignored
    pub fn handle_exit(&mut self, exit: WorkerExit) {
        let current = self
            .workers
            .get(&exit.bot)
            .map(|worker| worker.instance() == exit.instance)
            .unwrap_or(false);

        if !current {
            debug!(bot = %exit.bot, instance = exit.instance, "Ignoring exit of a stopped worker");
            return;
        }

        self.workers.remove(&exit.bot);
        self.running.remove(&exit.bot);
        metrics::gauge!("runner_workers_running").set(self.workers.len() as f64);
        info!(bot = %exit.bot, outcome = %exit.outcome, "Bot worker shut down");
    }

    /// Process events until `cancel` fires, then stop every worker
    ///
    /// A broken watch is re-established with backoff; running out of
    /// attempts is fatal.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let namespace = self.store.namespace().to_string();
        let policy = self.config.watch_retry.clone();
        let mut failures: u32 = 0;

        let result = 'watch: loop {
            let mut events = self.cluster.watch_runner(&namespace, &self.runner_name);
            info!(runner = %self.runner_name, "Watching desired state");

            let reason = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'watch Ok(()),
                    Some(exit) = self.exits_rx.recv() => self.handle_exit(exit),
                    event = events.next() => match event {
                        Some(Ok(runner)) => {
                            failures = 0;
                            let (latest, queued_error) = newest_ready(runner, &mut events);
                            self.apply_observed(&latest).await;
                            if let Some(e) = queued_error {
                                break e;
                            }
                        }
                        Some(Err(e)) => break e,
                        None => break RunnerError::TransientCluster("watch stream ended".into()),
                    },
                }
            };

            failures += 1;
            if failures >= policy.max_attempts {
                break Err(RunnerError::TransientCluster(format!(
                    "desired-state watch failed {} times: {}",
                    failures, reason
                )));
            }

            let delay = policy.delay_for(failures);
            warn!(runner = %self.runner_name, error = %reason, attempt = failures, ?delay, "Desired-state watch broke, reconnecting");

            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.shutdown().await;
        result
    }

    /// Stop every worker
    pub async fn shutdown(&mut self) {
        let workers: Vec<Worker> = self.workers.drain().map(|(_, worker)| worker).collect();
        if workers.is_empty() {
            return;
        }

        info!(count = workers.len(), "Stopping bot workers");
        for worker in &workers {
            self.running.remove(worker.bot());
        }
        join_all(workers.into_iter().map(Worker::terminate)).await;
        metrics::gauge!("runner_workers_running").set(0.0);
    }
}

/// Skip ahead to the newest state the watch has already delivered
///
/// An error or end of stream found while draining is returned alongside.
fn newest_ready(
    mut latest: BotRunner,
    events: &mut BoxStream<'static, Result<BotRunner>>,
) -> (BotRunner, Option<RunnerError>) {
    let mut skipped = 0usize;
    let queued_error = loop {
        match events.next().now_or_never() {
            Some(Some(Ok(newer))) => {
                latest = newer;
                skipped += 1;
            }
            Some(Some(Err(e))) => break Some(e),
            Some(None) => break Some(RunnerError::TransientCluster("watch stream ended".into())),
            None => break None,
        }
    };

    if skipped > 0 {
        debug!(runner = %latest.name_any(), skipped, "Collapsed queued desired-state events");
    }
    (latest, queued_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::resources::{Bot, BotCode, BotSpec};
    use crate::sandbox::address::AddressPolicy;
    use crate::sandbox::resolver::{FilteredResolver, StaticLookup};
    use crate::sandbox::source::{SourceFetcher, SourceTree};
    use crate::cluster::resources::RemoteSource;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;
    use parking_lot::Mutex;

    struct NoSource;

    #[async_trait]
    impl SourceFetcher for NoSource {
        async fn fetch(&self, _source: &RemoteSource) -> Result<SourceTree> {
            Err(RunnerError::SandboxFilesystem("no remote sources in tests".into()))
        }
    }

    /// Launcher whose workers idle until stopped
    #[derive(Default)]
    struct IdleLauncher {
        launched: Mutex<Vec<LaunchRequest>>,
    }

    #[async_trait]
    impl WorkerLauncher for IdleLauncher {
        async fn launch(&self, request: LaunchRequest, exits: mpsc::UnboundedSender<WorkerExit>) -> Result<Worker> {
            self.launched.lock().push(request.clone());
            let stop = CancellationToken::new();
            let task = {
                let stop = stop.clone();
                let bot = request.bot.clone();
                let instance = request.instance;
                tokio::spawn(async move {
                    stop.cancelled().await;
                    let _ = exits.send(WorkerExit {
                        bot,
                        instance,
                        outcome: crate::runtime::worker::ExitOutcome::Stopped,
                    });
                })
            };
            Ok(Worker::new(request.bot, request.instance, stop, task))
        }
    }

    fn bot(name: &str) -> Bot {
        let mut bot = Bot::new(
            name,
            BotSpec {
                code: BotCode::FromString { value: format!("// {}", name) },
                commands: vec![],
                message_hooks: vec![],
                webhooks: vec![],
            },
        );
        bot.metadata.namespace = Some("ns".into());
        bot
    }

    async fn setup() -> (Arc<InMemoryCluster>, Arc<IdleLauncher>, ReconciliationLoop) {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_pod(
            "ns",
            Pod {
                metadata: ObjectMeta {
                    name: Some("client-a".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let host = cluster.get_pod("ns", "client-a").await.unwrap();

        let store = RunnerResourceStore::new(cluster.clone(), "ns", RetryPolicy::none());
        store.create(&host).await.unwrap();

        let resolver = FilteredResolver::new(Arc::new(StaticLookup::new()), AddressPolicy::with_defaults());
        let sandbox = Arc::new(SandboxRuntime::new(resolver, Arc::new(NoSource), 4096));
        let launcher = Arc::new(IdleLauncher::default());

        let reconciler = ReconciliationLoop::new(
            cluster.clone(),
            store,
            "client-a",
            sandbox,
            launcher.clone(),
            RunningBots::new(),
            ReconcilerConfig::default(),
        );
        (cluster, launcher, reconciler)
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_starts_desired_bots() {
        let (cluster, launcher, mut reconciler) = setup().await;
        cluster.insert_bot("ns", bot("greeter"));

        let outcome = reconciler.apply(&set(&["greeter"])).await;

        assert_eq!(outcome.started, vec!["greeter"]);
        assert_eq!(outcome.patched, Some(vec!["greeter".to_string()]));
        assert_eq!(reconciler.running(), vec!["greeter"]);

        let launched = launcher.launched.lock();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].namespace, "ns");
        assert_eq!(launched[0].api_version, API_VERSION);
        assert!(launched[0].snapshot.files.contains_key("/main"));
    }

    #[tokio::test]
    async fn test_failed_fetch_drops_bot() {
        let (cluster, _launcher, mut reconciler) = setup().await;
        cluster.insert_bot("ns", bot("greeter"));
        cluster.fail_bot_fetch("greeter");

        let outcome = reconciler.apply(&set(&["greeter"])).await;

        assert!(outcome.started.is_empty());
        assert!(matches!(outcome.failed[0].1, RunnerError::BotStartup { .. }));
        assert_eq!(outcome.patched, Some(vec![]));
    }

    #[tokio::test]
    async fn test_missing_bot_is_dropped_but_others_start() {
        let (cluster, _launcher, mut reconciler) = setup().await;
        cluster.insert_bot("ns", bot("echo"));

        let outcome = reconciler.apply(&set(&["echo", "ghost"])).await;

        assert_eq!(outcome.started, vec!["echo"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.patched, Some(vec!["echo".to_string()]));
    }

    #[tokio::test]
    async fn test_converged_state_is_noop() {
        let (cluster, _launcher, mut reconciler) = setup().await;
        cluster.insert_bot("ns", bot("greeter"));

        reconciler.apply(&set(&["greeter"])).await;
        let patches = cluster.runner_patches().len();

        let outcome = reconciler.apply(&set(&["greeter"])).await;
        assert!(outcome.is_noop());
        assert_eq!(outcome.patched, None);
        assert_eq!(cluster.runner_patches().len(), patches);
    }

    #[tokio::test]
    async fn test_stale_exit_is_ignored() {
        let (cluster, _launcher, mut reconciler) = setup().await;
        cluster.insert_bot("ns", bot("greeter"));
        reconciler.apply(&set(&["greeter"])).await;

        reconciler.handle_exit(WorkerExit {
            bot: "greeter".into(),
            instance: 999,
            outcome: crate::runtime::worker::ExitOutcome::Exited { code: Some(0) },
        });
        assert_eq!(reconciler.running(), vec!["greeter"]);

        reconciler.handle_exit(WorkerExit {
            bot: "greeter".into(),
            instance: 1,
            outcome: crate::runtime::worker::ExitOutcome::Exited { code: Some(0) },
        });
        assert!(reconciler.running().is_empty());
    }

    #[tokio::test]
    async fn test_stale_event_does_not_overwrite_newer_desired_state() {
        let (cluster, launcher, mut reconciler) = setup().await;
        cluster.insert_bot("ns", bot("greeter"));
        cluster.insert_bot("ns", bot("echo"));

        cluster.set_desired_bots("ns", "client-a", &["greeter"]).unwrap();
        let first = cluster.get_runner("ns", "client-a").await.unwrap();
        cluster.set_desired_bots("ns", "client-a", &["greeter", "echo"]).unwrap();
        let second = cluster.get_runner("ns", "client-a").await.unwrap();

        let outcome = reconciler.apply_observed(&first).await;
        assert_eq!(outcome.started, vec!["greeter"]);
        assert_eq!(outcome.patched, None);
        assert!(cluster.runner_patches().is_empty());
        assert_eq!(
            cluster.get_runner("ns", "client-a").await.unwrap().spec.bots,
            vec!["greeter", "echo"]
        );

        let outcome = reconciler.apply_observed(&second).await;
        assert_eq!(outcome.started, vec!["echo"]);
        assert_eq!(outcome.patched, Some(vec!["echo".to_string(), "greeter".to_string()]));

        // The write-back echo is already converged
        let echo = cluster.get_runner("ns", "client-a").await.unwrap();
        assert!(reconciler.apply_observed(&echo).await.is_noop());
        assert_eq!(launcher.launched.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_newest_ready_collapses_queued_events() {
        let (cluster, _launcher, _reconciler) = setup().await;
        let mut events = cluster.watch_runner("ns", "client-a");
        let current = events.next().await.unwrap().unwrap();

        cluster.set_desired_bots("ns", "client-a", &["greeter"]).unwrap();
        cluster.set_desired_bots("ns", "client-a", &["greeter", "echo"]).unwrap();

        let (latest, queued_error) = newest_ready(current, &mut events);
        assert_eq!(latest.spec.bots, vec!["greeter", "echo"]);
        assert!(queued_error.is_none());
    }
}
