// src/ipc/mod.rs
//! Inter-process messaging between controller and client hosts
//!
//! All hosts share one broadcast topic. Messages carry a target endpoint id
//! and the sender travels as the record key; [`IpcEndpoint`] layers
//! correlated request/response on top.

pub mod endpoint;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod message;
pub mod transport;

pub use endpoint::{IpcEndpoint, LocalBotsHandler, Reply, RequestHandler, RunningBots};
pub use message::{EndpointId, IpcErrorBody, IpcErrorKind, IpcMessage, MessageType, Payload};
pub use transport::{BusRecord, BusTransport, InMemoryBus};

use crate::utils::config::{BusConfig, BusTransportKind};
use crate::utils::errors::{Result, RunnerError};
use crate::utils::retry::retry;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::info;

/// Build the transport selected by configuration
pub fn connect_bus(config: &BusConfig) -> Result<Arc<dyn BusTransport>> {
    match config.transport {
        BusTransportKind::Memory => Ok(Arc::new(InMemoryBus::new())),
        #[cfg(feature = "kafka")]
        BusTransportKind::Kafka => Ok(Arc::new(kafka::KafkaBus::new(config)?)),
        #[cfg(not(feature = "kafka"))]
        BusTransportKind::Kafka => Err(RunnerError::Configuration(
            "bus.transport = kafka requires the `kafka` feature".into(),
        )),
    }
}

/// Wait until at least one broker accepts a TCP connection
pub async fn wait_for_brokers(config: &BusConfig) -> Result<()> {
    if config.transport != BusTransportKind::Kafka {
        return Ok(());
    }
    if config.brokers.is_empty() {
        return Err(RunnerError::Configuration("bus.brokers is empty".into()));
    }

    retry(&config.broker_wait, "Broker connection", || async move {
        let mut last_error = None;
        for broker in &config.brokers {
            match TcpStream::connect(broker.as_str()).await {
                Ok(_) => {
                    info!(broker = %broker, "Message bus broker reachable");
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .map(RunnerError::Io)
            .unwrap_or_else(|| RunnerError::Timeout("no broker reachable".into())))
    })
    .await
}
