// src/ipc/endpoint.rs
//! Request/response engine over the broadcast bus
//!
//! An [`IpcEndpoint`] consumes the shared topic, drops records it sent itself
//! and messages addressed to anyone else, answers requests through a
//! [`RequestHandler`], and routes responses to the waiting caller. Waiters are
//! keyed by `(type, request id, counterpart)`, so concurrent requests of the
//! same type never resolve against each other's response.

use crate::cluster::resources::HostRole;
use crate::ipc::message::{EndpointId, IpcErrorBody, IpcMessage, MessageType, Payload};
use crate::ipc::transport::{BusRecord, BusTransport};
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type Reply = std::result::Result<Payload, IpcErrorBody>;

/// Serves incoming requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &IpcMessage, sender: &EndpointId) -> Reply;
}

/// Names of the bots whose workers are online on this host
#[derive(Debug, Clone, Default)]
pub struct RunningBots {
    inner: Arc<RwLock<BTreeSet<String>>>,
}

impl RunningBots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bot: impl Into<String>) -> bool {
        self.inner.write().insert(bot.into())
    }

    pub fn remove(&self, bot: &str) -> bool {
        self.inner.write().remove(bot)
    }

    pub fn contains(&self, bot: &str) -> bool {
        self.inner.read().contains(bot)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Sorted snapshot
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.read().iter().cloned().collect()
    }
}

/// Answers `bots:discover` from the local worker inventory
pub struct LocalBotsHandler {
    role: HostRole,
    running: RunningBots,
}

impl LocalBotsHandler {
    pub fn new(role: HostRole, running: RunningBots) -> Self {
        Self { role, running }
    }
}

#[async_trait]
impl RequestHandler for LocalBotsHandler {
    async fn handle(&self, request: &IpcMessage, _sender: &EndpointId) -> Reply {
        match (&request.kind, self.role) {
            (MessageType::DiscoverBots, HostRole::Client) => Ok(Payload::Bots(self.running.snapshot())),
            (kind, _) => Err(IpcErrorBody::unsupported(kind)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    kind: MessageType,
    request_id: u64,
    counterpart: EndpointId,
}

struct Inner {
    id: EndpointId,
    bus: Arc<dyn BusTransport>,
    topic: String,
    sequence: AtomicU64,
    pending: DashMap<PendingKey, oneshot::Sender<IpcMessage>>,
    handler: Arc<dyn RequestHandler>,
    request_timeout: Duration,
    cancel: CancellationToken,
}

/// One participant on the IPC topic
#[derive(Clone)]
pub struct IpcEndpoint {
    inner: Arc<Inner>,
}

impl IpcEndpoint {
    /// Subscribe to `topic` and start consuming
    ///
    /// The subscription exists when this returns, so requests sent afterwards
    /// cannot miss their responses.
    pub async fn start(
        id: EndpointId,
        bus: Arc<dyn BusTransport>,
        topic: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let topic = topic.into();
        let records = bus.subscribe(&topic, id.as_str()).await?;

        let endpoint = Self {
            inner: Arc::new(Inner {
                id,
                bus,
                topic,
                sequence: AtomicU64::new(0),
                pending: DashMap::new(),
                handler,
                request_timeout,
                cancel: CancellationToken::new(),
            }),
        };

        let consumer = endpoint.clone();
        tokio::spawn(async move { consumer.consume(records).await });

        info!(endpoint = %endpoint.id(), topic = %endpoint.inner.topic, "IPC endpoint started");
        Ok(endpoint)
    }

    pub fn id(&self) -> &EndpointId {
        &self.inner.id
    }

    /// Stop consuming; outstanding requests fail
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.pending.clear();
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Ask `target` which bots it is running
    pub async fn discover_bots(&self, target: &EndpointId) -> Result<Vec<String>> {
        let response = self.request(MessageType::DiscoverBots, target).await?;
        match response.payload {
            Payload::Bots(items) => Ok(items),
            other => Err(RunnerError::Ipc(format!(
                "'{}' response from {} carried no bot list: {:?}",
                MessageType::DiscoverBots,
                target,
                other
            ))),
        }
    }

    /// Send a request and wait for the matching response
    ///
    /// Error responses become [`RunnerError::IpcRemote`].
    pub async fn request(&self, kind: MessageType, target: &EndpointId) -> Result<IpcMessage> {
        let id = self.next_id();
        let key = PendingKey {
            kind: kind.clone(),
            request_id: id,
            counterpart: target.clone(),
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(key.clone(), tx);

        metrics::counter!("runner_ipc_requests_total", "type" => kind.to_string()).increment(1);

        let request = IpcMessage::request(kind.clone(), target.clone(), id);
        if let Err(e) = self.publish(&request).await {
            self.inner.pending.remove(&key);
            return Err(e);
        }
        debug!(endpoint = %self.id(), target = %target, id, kind = %kind, "Sent request");

        let response = match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(RunnerError::Ipc(format!("endpoint {} closed", self.id()))),
            Err(_) => {
                self.inner.pending.remove(&key);
                return Err(RunnerError::Timeout(format!(
                    "no '{}' response from {} within {:?}",
                    kind, target, self.inner.request_timeout
                )));
            }
        };

        match response.payload {
            Payload::Error(body) => Err(RunnerError::IpcRemote {
                sender: target.to_string(),
                kind: body.kind.as_str().to_string(),
                message: body.message,
            }),
            _ => Ok(response),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn publish(&self, message: &IpcMessage) -> Result<()> {
        let record = BusRecord::new(self.id().as_str(), message.encode()?);
        self.inner.bus.publish(&self.inner.topic, record).await
    }

    async fn consume(self, mut records: futures::stream::BoxStream<'static, Result<BusRecord>>) {
        loop {
            let next = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                next = records.next() => next,
            };

            match next {
                Some(Ok(record)) => self.dispatch(record),
                Some(Err(e)) => warn!(endpoint = %self.id(), error = %e, "Bus receive failed"),
                None => {
                    warn!(endpoint = %self.id(), "Bus subscription ended");
                    break;
                }
            }
        }

        self.inner.pending.clear();
        debug!(endpoint = %self.id(), "IPC endpoint stopped");
    }

    fn dispatch(&self, record: BusRecord) {
        if record.key == self.id().as_str() {
            return;
        }

        let message = match IpcMessage::decode(&record.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(endpoint = %self.id(), sender = %record.key, error = %e, "Skipping malformed record");
                return;
            }
        };

        if &message.target != self.id() {
            return;
        }

        let sender = EndpointId::from(record.key);
        debug!(endpoint = %self.id(), sender = %sender, id = message.id, kind = %message.kind, "Received message");

        if message.is_request {
            let endpoint = self.clone();
            tokio::spawn(async move { endpoint.answer(message, sender).await });
        } else {
            self.resolve(message, sender);
        }
    }

    fn resolve(&self, response: IpcMessage, sender: EndpointId) {
        let Some(request_id) = response.correlation_id else {
            return;
        };

        let key = PendingKey {
            kind: response.kind.clone(),
            request_id,
            counterpart: sender,
        };

        match self.inner.pending.remove(&key) {
            Some((_, waiter)) => {
                let _ = waiter.send(response);
            }
            None => debug!(
                endpoint = %self.id(),
                sender = %key.counterpart,
                request_id,
                "Dropping response with no waiter"
            ),
        }
    }

    async fn answer(&self, request: IpcMessage, sender: EndpointId) {
        let payload = match self.inner.handler.handle(&request, &sender).await {
            Ok(payload) => payload,
            Err(body) => {
                warn!(
                    endpoint = %self.id(),
                    sender = %sender,
                    kind = %request.kind,
                    error = %body.message,
                    "Rejecting request"
                );
                Payload::Error(body)
            }
        };

        let response = IpcMessage::response_to(&request, sender.clone(), self.next_id(), payload);
        if let Err(e) = self.publish(&response).await {
            error!(endpoint = %self.id(), target = %sender, error = %e, "Failed to send response");
        }
    }
}
