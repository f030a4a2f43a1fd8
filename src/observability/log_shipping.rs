// src/observability/log_shipping.rs
//! Ship formatted log lines to the bus log topic
//!
//! The writer never blocks the logging call site: lines are handed to a
//! bounded channel and dropped when it is full. A background task publishes
//! them keyed by host name.

use crate::ipc::transport::{BusRecord, BusTransport};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Targets that must not be shipped, or every publish would log another record
pub const UNSHIPPED_TARGETS: &[&str] = &[
    "botfleet_runner::ipc::kafka",
    "botfleet_runner::ipc::transport",
    "rdkafka",
    "librdkafka",
];

pub fn is_shippable(target: &str) -> bool {
    !UNSHIPPED_TARGETS.iter().any(|prefix| target.starts_with(prefix))
}

/// Log topic paired with a control-plane topic
pub fn log_topic(topic: &str) -> String {
    format!("{}-log", topic)
}

#[derive(Clone)]
pub struct BusLogWriter {
    tx: mpsc::Sender<Bytes>,
}

impl BusLogWriter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl io::Write for BusLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = trim_line(buf);
        if !line.is_empty() {
            // Dropped when the shipper falls behind
            let _ = self.tx.try_send(Bytes::copy_from_slice(line));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for BusLogWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &buf[..end]
}

/// Start the publishing task; it ends once every writer is dropped
pub fn spawn_log_shipper(
    bus: Arc<dyn BusTransport>,
    topic: String,
    host: String,
    capacity: usize,
) -> (BusLogWriter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = bus.publish(&topic, BusRecord::new(host.clone(), line)).await {
                // Logging here would feed back into the shipper
                eprintln!("log shipping to {} failed: {}", topic, e);
            }
        }
    });

    (BusLogWriter::new(tx), handle)
}
