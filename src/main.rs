// src/main.rs
//! Botfleet Runner
//!
//! One binary for every role: the controller host, client hosts, and the
//! bot workers a client launches (selected by `RUNNER_ROLE=bot`).

use anyhow::{Context, Result};
use botfleet_runner::cluster::{HostRole, KubeCluster};
use botfleet_runner::context::AppContext;
use botfleet_runner::ipc::{connect_bus, wait_for_brokers};
use botfleet_runner::observability::{init_metrics, init_tracing, log_topic, spawn_log_shipper};
use botfleet_runner::runtime::bot::run_bot;
use botfleet_runner::runtime::worker::{ENV_ROLE, ROLE_BOT};
use botfleet_runner::runtime::{run_client, run_controller};
use botfleet_runner::utils::config::{RunEnv, RunnerConfig};
use botfleet_runner::BuildInfo;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const LOG_SHIPPING_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RunnerConfig::load().context("Failed to load configuration")?;

    if std::env::var(ENV_ROLE).as_deref() == Ok(ROLE_BOT) {
        init_tracing(&config, None)?;
        return Ok(run_bot(&config).await?);
    }

    config.validate_host()?;
    let host_name = config.host_name()?;
    let bus = connect_bus(&config.bus)?;

    let shipper = if config.bus.ship_logs {
        let (writer, _handle) = spawn_log_shipper(
            bus.clone(),
            log_topic(&config.bus.topic),
            host_name.clone(),
            LOG_SHIPPING_CAPACITY,
        );
        Some(writer)
    } else {
        None
    };

    init_tracing(&config, shipper)?;
    init_metrics(config.observability.metrics_addr)?;

    let build = BuildInfo::current();
    info!(
        version = build.version,
        git_hash = build.git_hash,
        env = ?config.env,
        host = %host_name,
        "Starting bot runner"
    );

    if config.env != RunEnv::Testing {
        wait_for_brokers(&config.bus).await?;
    }

    let cluster = Arc::new(KubeCluster::try_default(config.cluster.page_size).await?);
    let ctx = AppContext::new(config, cluster, bus, host_name);

    let role = ctx.pod_registry().current_role().await?;
    info!(role = ?role, "Resolved host role");

    let cancel = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("Received shutdown signal, cleaning up...");
        shutdown.cancel();
    });

    let result = match role {
        HostRole::Controller => run_controller(&ctx, cancel).await,
        HostRole::Client => run_client(&ctx, cancel).await,
    };

    match result {
        Ok(()) => {
            info!("Bot runner stopped");
            Ok(())
        }
        Err(e) => {
            error!("Bot runner error: {}", e);
            Err(e.into())
        }
    }
}
