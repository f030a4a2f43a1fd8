// src/ipc/kafka.rs
//! Kafka-backed [`BusTransport`]
//!
//! Each subscriber gets its own consumer (group `<group>-<consumer>`) so every
//! endpoint observes every record on the shared topic. Partitions are
//! assigned by hand at their current end offsets before `subscribe` returns,
//! so nothing published afterwards can be missed while a group rebalance is
//! still pending.

use crate::ipc::transport::{BusRecord, BusTransport};
use crate::utils::config::BusConfig;
use crate::utils::errors::{Result, RunnerError};
use crate::utils::retry::{retry, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaBus {
    producer: FutureProducer,
    brokers: String,
    group_id: String,
    assign_retry: RetryPolicy,
}

impl KafkaBus {
    pub fn new(config: &BusConfig) -> Result<Self> {
        let brokers = config.brokers.join(",");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("allow.auto.create.topics", "true")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| RunnerError::Configuration(format!("Failed to create Kafka producer: {}", e)))?;

        info!(brokers = %brokers, "Kafka producer ready");

        Ok(Self {
            producer,
            brokers,
            group_id: config.group_id.clone(),
            assign_retry: config.broker_wait.clone(),
        })
    }
}

#[async_trait]
impl BusTransport for KafkaBus {
    async fn publish(&self, topic: &str, record: BusRecord) -> Result<()> {
        let delivery = FutureRecord::to(topic)
            .key(&record.key)
            .payload(record.payload.as_ref());

        let (partition, offset) = self
            .producer
            .send(delivery, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| RunnerError::Ipc(format!("Failed to publish to {}: {}", topic, e)))?;

        debug!(topic, partition, offset, "Published bus record");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, consumer: &str) -> Result<BoxStream<'static, Result<BusRecord>>> {
        let group = format!("{}-{}", self.group_id, consumer);

        let subscriber: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &group)
            .set("allow.auto.create.topics", "true")
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| RunnerError::Configuration(format!("Failed to create Kafka consumer: {}", e)))?;
        let subscriber = Arc::new(subscriber);

        let assignment = retry(&self.assign_retry, "Kafka partition lookup", || {
            let subscriber = subscriber.clone();
            let topic = topic.to_string();
            async move {
                tokio::task::spawn_blocking(move || end_offsets(&subscriber, &topic))
                    .await
                    .map_err(|e| RunnerError::Ipc(format!("partition lookup task failed: {}", e)))?
            }
        })
        .await?;

        subscriber
            .assign(&assignment)
            .map_err(|e| RunnerError::Ipc(format!("Failed to assign {} partitions: {}", topic, e)))?;

        info!(topic, group = %group, partitions = assignment.count(), "Subscribed to bus topic");

        Ok(stream::unfold(subscriber, |subscriber| async move {
            let item = match subscriber.recv().await {
                Ok(message) => Ok(BusRecord {
                    key: message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned())
                        .unwrap_or_default(),
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                }),
                Err(e) => Err(RunnerError::Ipc(format!("Kafka receive failed: {}", e))),
            };
            Some((item, subscriber))
        })
        .boxed())
    }
}

/// Current end offset of every partition of `topic` (blocking)
fn end_offsets(consumer: &StreamConsumer, topic: &str) -> Result<TopicPartitionList> {
    let metadata = consumer
        .fetch_metadata(Some(topic), METADATA_TIMEOUT)
        .map_err(|e| RunnerError::Timeout(format!("metadata for {}: {}", topic, e)))?;

    let partitions: Vec<i32> = metadata
        .topics()
        .iter()
        .filter(|t| t.name() == topic)
        .flat_map(|t| t.partitions().iter().map(|p| p.id()))
        .collect();

    // Auto-created topics can take a moment to get partitions
    if partitions.is_empty() {
        return Err(RunnerError::Timeout(format!("topic {} has no partitions yet", topic)));
    }

    let mut ends = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let (_low, high) = consumer
            .fetch_watermarks(topic, partition, METADATA_TIMEOUT)
            .map_err(|e| RunnerError::Timeout(format!("watermarks for {}/{}: {}", topic, partition, e)))?;
        ends.push((partition, high));
    }

    assignment_at(topic, &ends)
}

/// Assignment starting each partition at the given offset
fn assignment_at(topic: &str, offsets: &[(i32, i64)]) -> Result<TopicPartitionList> {
    let mut assignment = TopicPartitionList::with_capacity(offsets.len());
    for &(partition, offset) in offsets {
        assignment
            .add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(|e| RunnerError::Ipc(format!("invalid offset for {}/{}: {}", topic, partition, e)))?;
    }
    Ok(assignment)
}
