// src/ipc/transport.rs
//! Broadcast bus transport
//!
//! Every subscriber of a topic sees every record published to it after the
//! subscription was made, including its own.

use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::warn;

/// One record on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    /// Sender identity
    pub key: String,
    pub payload: Bytes,
}

impl BusRecord {
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe access to the bus
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn publish(&self, topic: &str, record: BusRecord) -> Result<()>;

    /// Subscribe `consumer` to `topic`; each consumer receives every record
    async fn subscribe(&self, topic: &str, consumer: &str) -> Result<BoxStream<'static, Result<BusRecord>>>;
}

/// In-process broadcast bus
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<BusRecord>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusRecord> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for InMemoryBus {
    async fn publish(&self, topic: &str, record: BusRecord) -> Result<()> {
        // No subscribers is not an error on a broadcast bus
        let _ = self.sender(topic).send(record);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, consumer: &str) -> Result<BoxStream<'static, Result<BusRecord>>> {
        let receiver = self.sender(topic).subscribe();
        let consumer = consumer.to_string();

        Ok(stream::unfold((receiver, consumer), |(mut receiver, consumer)| async move {
            match receiver.recv().await {
                Ok(record) => Some((Ok(record), (receiver, consumer))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(consumer = %consumer, skipped, "Bus subscriber lagged");
                    let err = RunnerError::Ipc(format!("{} lagged by {} records", consumer, skipped));
                    Some((Err(err), (receiver, consumer)))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_record() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("control", "a").await.unwrap();
        let mut b = bus.subscribe("control", "b").await.unwrap();

        bus.publish("control", BusRecord::new("a", "hello")).await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap().payload, Bytes::from("hello"));
        assert_eq!(b.next().await.unwrap().unwrap().key, "a");
    }

    #[tokio::test]
    async fn test_topics_are_separate() {
        let bus = InMemoryBus::new();
        let mut logs = bus.subscribe("control-log", "a").await.unwrap();

        bus.publish("control", BusRecord::new("a", "ipc")).await.unwrap();
        bus.publish("control-log", BusRecord::new("a", "log")).await.unwrap();

        assert_eq!(logs.next().await.unwrap().unwrap().payload, Bytes::from("log"));
    }
}
