// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Logs always go to stderr (worker stdout is reserved for the online
//! signal). Hosts can additionally ship JSON log lines to the bus log topic.

pub mod log_shipping;

pub use log_shipping::{is_shippable, log_topic, spawn_log_shipper, BusLogWriter};

use crate::utils::config::{RunEnv, RunnerConfig};
use crate::utils::errors::{Result, RunnerError};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Whether stderr logs are JSON: explicit setting, else JSON in production
pub fn use_json_logs(config: &RunnerConfig) -> bool {
    config
        .observability
        .json_logs
        .unwrap_or(config.env == RunEnv::Production)
}

/// Install the global subscriber
pub fn init_tracing(config: &RunnerConfig, shipper: Option<BusLogWriter>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.env.default_log_level()));

    let stderr_layer = if use_json_logs(config) {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let shipping_layer = shipper.map(|writer| {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(filter_fn(|meta| is_shippable(meta.target())))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(shipping_layer)
        .try_init()
        .map_err(|e| RunnerError::Configuration(format!("Failed to install tracing subscriber: {}", e)))
}

/// Serve Prometheus metrics on `addr` when configured
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| RunnerError::Configuration(format!("Failed to start metrics exporter on {}: {}", addr, e)))?;

    metrics::describe_counter!("runner_ipc_requests_total", "IPC requests sent, by message type");
    metrics::describe_counter!("runner_worker_starts_total", "Bot workers that came online");
    metrics::describe_counter!("runner_worker_start_failures_total", "Bot workers that failed to start");
    metrics::describe_gauge!("runner_workers_running", "Bot workers currently running");

    Ok(())
}
