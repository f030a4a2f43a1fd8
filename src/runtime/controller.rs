// src/runtime/controller.rs
//! Controller host entry
//!
//! Makes sure at least one client host exists, then asks every client which
//! bots it is running.

use crate::cluster::pods::PodRegistry;
use crate::cluster::resources::{host_role, HostRole};
use crate::cluster::spawner::ClientSpawner;
use crate::context::AppContext;
use crate::ipc::endpoint::{IpcEndpoint, LocalBotsHandler, RunningBots};
use crate::ipc::message::EndpointId;
use crate::utils::errors::{Result, RunnerError};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bots reported by each client host, keyed by host name
pub type Placement = BTreeMap<String, Result<Vec<String>>>;

pub struct Controller {
    registry: PodRegistry,
    spawner: ClientSpawner,
    endpoint: IpcEndpoint,
}

impl Controller {
    pub fn new(registry: PodRegistry, spawner: ClientSpawner, endpoint: IpcEndpoint) -> Self {
        Self {
            registry,
            spawner,
            endpoint,
        }
    }

    /// Known client hosts, spawning one when there are none
    pub async fn ensure_client(&self) -> Result<Vec<Pod>> {
        let hosts = self.registry.list_annotated_hosts().await?;

        let (controllers, clients): (Vec<Pod>, Vec<Pod>) = hosts
            .into_iter()
            .filter(|host| host_role(host).is_ok())
            .partition(|host| matches!(host_role(host), Ok(HostRole::Controller)));

        info!(controllers = controllers.len(), clients = clients.len(), "Discovered runner hosts");

        if !clients.is_empty() {
            return Ok(clients);
        }

        info!("No client hosts found, spawning one");
        Ok(vec![self.spawner.spawn_client().await?])
    }

    /// Ask every client for its running bots; failures are reported per client
    pub async fn discover_placements(&self, clients: &[Pod]) -> Placement {
        let queries = clients.iter().map(|client| async move {
            let name = client.name_any();
            let target = EndpointId::new(&name, HostRole::Client);
            let bots = self.endpoint.discover_bots(&target).await;
            if let Err(e) = &bots {
                warn!(client = %name, error = %e, "Failed to query client bots");
            }
            (name, bots)
        });

        join_all(queries).await.into_iter().collect()
    }
}

/// Run as the controller host until cancelled
pub async fn run_controller(ctx: &AppContext, cancel: CancellationToken) -> Result<()> {
    let registry = ctx.pod_registry();
    if registry.current_role().await? != HostRole::Controller {
        return Err(RunnerError::Configuration(format!(
            "{} is not annotated as a controller host",
            ctx.host_name
        )));
    }

    let endpoint = ctx
        .start_endpoint(
            HostRole::Controller,
            Arc::new(LocalBotsHandler::new(HostRole::Controller, RunningBots::new())),
        )
        .await?;

    let controller = Controller::new(registry, ctx.client_spawner(), endpoint.clone());

    let clients = tokio::select! {
        _ = cancel.cancelled() => {
            endpoint.close();
            return Ok(());
        }
        clients = controller.ensure_client() => clients?,
    };

    let placement = controller.discover_placements(&clients).await;
    for (client, bots) in &placement {
        match bots {
            Ok(bots) => info!(client = %client, bots = ?bots, "Client placement"),
            Err(e) => warn!(client = %client, error = %e, "Client placement unknown"),
        }
    }

    info!(host = %ctx.host_name, "Bot runner controller is online");
    cancel.cancelled().await;
    endpoint.close();
    Ok(())
}
