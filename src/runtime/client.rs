// src/runtime/client.rs
//! Client host entry: own a BotRunner and keep its bots running

use crate::cluster::resources::HostRole;
use crate::context::AppContext;
use crate::ipc::endpoint::{LocalBotsHandler, RunningBots};
use crate::runtime::limits::CgroupLimiter;
use crate::runtime::reconciler::ReconciliationLoop;
use crate::runtime::worker::{ProcessLauncher, WorkerLauncher};
use crate::sandbox::runtime::SandboxRuntime;
use crate::utils::errors::{Result, RunnerError};
use kube::ResourceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run as a client host with the process launcher and system resolver
pub async fn run_client(ctx: &AppContext, cancel: CancellationToken) -> Result<()> {
    let sandbox = Arc::new(SandboxRuntime::from_settings(&ctx.config.sandbox)?);
    let launcher = ProcessLauncher::from_config(&ctx.config.reconciler)?
        .with_limiter(CgroupLimiter::detect(&ctx.config.sandbox.worker_limits));

    run_client_with(ctx, sandbox, Arc::new(launcher), cancel).await
}

/// Run as a client host with the given sandbox and launcher
pub async fn run_client_with(
    ctx: &AppContext,
    sandbox: Arc<SandboxRuntime>,
    launcher: Arc<dyn WorkerLauncher>,
    cancel: CancellationToken,
) -> Result<()> {
    let registry = ctx.pod_registry();
    let host = registry.current_host().await?;
    if registry.role(&host)? != HostRole::Client {
        return Err(RunnerError::Configuration(format!(
            "{} is not annotated as a client host",
            ctx.host_name
        )));
    }

    let runner = ctx.runner_store().create(&host).await?;

    let running = RunningBots::new();
    let endpoint = ctx
        .start_endpoint(
            HostRole::Client,
            Arc::new(LocalBotsHandler::new(HostRole::Client, running.clone())),
        )
        .await?;

    info!(host = %ctx.host_name, runner = %runner.name_any(), "Bot runner client is online");

    let mut reconciler = ReconciliationLoop::new(
        ctx.cluster.clone(),
        ctx.runner_store(),
        runner.name_any(),
        sandbox,
        launcher,
        running,
        ctx.config.reconciler.clone(),
    )
    .with_fetch_retry(ctx.config.cluster.retry.clone());

    let result = reconciler.run(cancel).await;
    endpoint.close();
    result
}
