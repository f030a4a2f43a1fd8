// src/ipc/message.rs
//! IPC message types and wire format
//!
//! On the bus every message is a JSON object
//! `{type, target, id, isRequest, correlationId?, items?, error?}`; the
//! sender's endpoint id travels as the record key. [`IpcMessage`] is the
//! validated form: decoding checks that the payload fields agree with the
//! message type and direction.

use crate::cluster::resources::HostRole;
use crate::utils::errors::{Result, RunnerError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable endpoint identity: `<host-name>-<role>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(host_name: &str, role: HostRole) -> Self {
        Self(format!("{}-{}", host_name, role.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Message type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Enumerate the bots a client is running
    DiscoverBots,
    /// Any type this build does not know; answered with `unsupported`
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::DiscoverBots => "bots:discover",
            MessageType::Other(other) => other,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "bots:discover" => MessageType::DiscoverBots,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcErrorKind {
    /// The receiver does not serve this request type
    Unsupported,
    /// The receiver failed while serving the request
    Internal,
    /// The request was malformed
    BadRequest,
}

impl IpcErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpcErrorKind::Unsupported => "unsupported",
            IpcErrorKind::Internal => "internal",
            IpcErrorKind::BadRequest => "bad_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcErrorBody {
    pub kind: IpcErrorKind,
    pub message: String,
}

impl IpcErrorBody {
    pub fn unsupported(kind: &MessageType) -> Self {
        Self {
            kind: IpcErrorKind::Unsupported,
            message: format!("request type '{}' is not served here", kind),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: IpcErrorKind::Internal,
            message: message.into(),
        }
    }
}

/// Type-specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Requests carry no body
    Empty,
    /// Bot names served by a client
    Bots(Vec<String>),
    /// Typed failure
    Error(IpcErrorBody),
}

/// A validated IPC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub kind: MessageType,
    pub target: EndpointId,
    /// Per-sender sequence number
    pub id: u64,
    pub is_request: bool,
    /// For responses: the id of the request being answered
    pub correlation_id: Option<u64>,
    pub payload: Payload,
}

impl IpcMessage {
    pub fn request(kind: MessageType, target: EndpointId, id: u64) -> Self {
        Self {
            kind,
            target,
            id,
            is_request: true,
            correlation_id: None,
            payload: Payload::Empty,
        }
    }

    /// Response to `request`, addressed back to its sender
    pub fn response_to(request: &IpcMessage, sender: EndpointId, id: u64, payload: Payload) -> Self {
        Self {
            kind: request.kind.clone(),
            target: sender,
            id,
            is_request: false,
            correlation_id: Some(request.id),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let wire = WireMessage::from(self);
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireMessage = serde_json::from_slice(bytes)?;
        IpcMessage::try_from(wire)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    target: EndpointId,
    id: u64,
    is_request: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    items: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<IpcErrorBody>,
}

impl From<&IpcMessage> for WireMessage {
    fn from(message: &IpcMessage) -> Self {
        let (items, error) = match &message.payload {
            Payload::Empty => (None, None),
            Payload::Bots(items) => (Some(items.clone()), None),
            Payload::Error(error) => (None, Some(error.clone())),
        };

        Self {
            kind: message.kind.clone(),
            target: message.target.clone(),
            id: message.id,
            is_request: message.is_request,
            correlation_id: message.correlation_id,
            items,
            error,
        }
    }
}

impl TryFrom<WireMessage> for IpcMessage {
    type Error = RunnerError;

    fn try_from(wire: WireMessage) -> Result<Self> {
        let payload = match (wire.is_request, wire.items, wire.error) {
            (true, None, None) => Payload::Empty,
            (true, _, _) => {
                return Err(RunnerError::Ipc(format!(
                    "request {} '{}' carries a response body",
                    wire.id, wire.kind
                )))
            }
            (false, None, Some(error)) => Payload::Error(error),
            (false, Some(items), None) => Payload::Bots(items),
            (false, None, None) => Payload::Empty,
            (false, Some(_), Some(_)) => {
                return Err(RunnerError::Ipc(format!(
                    "response {} '{}' carries both items and error",
                    wire.id, wire.kind
                )))
            }
        };

        if !wire.is_request && wire.correlation_id.is_none() {
            return Err(RunnerError::Ipc(format!(
                "response {} '{}' has no correlation id",
                wire.id, wire.kind
            )));
        }

        Ok(IpcMessage {
            kind: wire.kind,
            target: wire.target,
            id: wire.id,
            is_request: wire.is_request,
            correlation_id: wire.correlation_id,
            payload,
        })
    }
}
