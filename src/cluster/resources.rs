// src/cluster/resources.rs
//! Custom resources and host helpers
//!
//! `BotRunner` is the desired-state record for one client host; `Bot` holds a
//! bot's code and its command, message-hook and webhook definitions. Hosts are
//! plain pods classified by annotation.

use crate::utils::errors::{Result, RunnerError};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// API group of the custom resources
pub const API_GROUP: &str = "botfleet.dev";

/// API version of the custom resources
pub const API_VERSION: &str = "botfleet.dev/v1alpha1";

/// Role annotation on every managed host
pub const ANNOTATION_TYPE: &str = "runner.botfleet.dev/type";

/// Parent link on client hosts and BotRunner resources
pub const ANNOTATION_OWNED_BY: &str = "runner.botfleet.dev/owned-by";

/// Desired set of bots for one client host
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "botfleet.dev",
    version = "v1alpha1",
    kind = "BotRunner",
    plural = "botrunners",
    namespaced
)]
pub struct BotRunnerSpec {
    /// Names of bots that should be running (treated as a set)
    #[serde(default)]
    pub bots: Vec<String>,
}

impl BotRunnerSpec {
    pub fn bot_set(&self) -> BTreeSet<String> {
        self.bots.iter().cloned().collect()
    }
}

impl BotRunner {
    /// Host name recorded in the `owned-by` annotation
    pub fn owned_by(&self) -> Option<&str> {
        self.annotations().get(ANNOTATION_OWNED_BY).map(String::as_str)
    }
}

/// A bot: its code plus handler definitions
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "botfleet.dev",
    version = "v1alpha1",
    kind = "Bot",
    plural = "bots",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BotSpec {
    pub code: BotCode,

    #[serde(default)]
    pub commands: Vec<BotCommandEntry>,

    #[serde(default)]
    pub message_hooks: Vec<BotMessageHookEntry>,

    #[serde(default)]
    pub webhooks: Vec<BotWebhookEntry>,
}

/// Where a piece of bot code comes from (exactly one source)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum BotCode {
    FromString { value: String },
    FromRepo(RemoteSource),
}

impl BotCode {
    pub fn inline(&self) -> Option<&str> {
        match self {
            BotCode::FromString { value } => Some(value),
            BotCode::FromRepo(_) => None,
        }
    }
}

/// Remote source to clone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RemoteSource {
    #[serde(alias = "repo", alias = "url")]
    pub address: String,

    #[serde(rename = "ref")]
    pub reference: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

/// Reference to the resource a handler definition was taken from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BotCommandSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub code: BotCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BotCommandEntry {
    pub spec: BotCommandSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ResourceReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BotMessageHookSpec {
    /// Pattern matched against incoming messages
    pub regex: String,

    pub code: BotCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BotMessageHookEntry {
    pub spec: BotMessageHookSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ResourceReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BotWebhookSpec {
    pub id: String,

    pub code: BotCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BotWebhookEntry {
    pub spec: BotWebhookSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ResourceReference>,
}

/// Role a host plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Controller,
    Client,
}

impl HostRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostRole::Controller => "controller",
            HostRole::Client => "client",
        }
    }
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostRole {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "controller" => Ok(HostRole::Controller),
            "client" => Ok(HostRole::Client),
            other => Err(RunnerError::Configuration(format!(
                "Role annotation must be 'controller' or 'client', got '{}'",
                other
            ))),
        }
    }
}

/// Read a host's role annotation
pub fn host_role(host: &Pod) -> Result<HostRole> {
    let value = host.annotations().get(ANNOTATION_TYPE).ok_or_else(|| {
        RunnerError::Configuration(format!(
            "Host {} has no {} annotation",
            host.name_any(),
            ANNOTATION_TYPE
        ))
    })?;

    value.parse()
}

/// Whether a host carries the role annotation at all
pub fn is_annotated(host: &Pod) -> bool {
    host.annotations().contains_key(ANNOTATION_TYPE)
}

/// Phase is `Running` and at least one container is ready
pub fn is_host_ready(host: &Pod) -> bool {
    let Some(status) = host.status.as_ref() else {
        return false;
    };

    let any_ready = status
        .container_statuses
        .as_ref()
        .map(|statuses| statuses.iter().any(|s| s.ready))
        .unwrap_or(false);

    any_ready && status.phase.as_deref() == Some("Running")
}

/// Owner reference pointing at `host`
pub fn host_owner_reference(host: &Pod, controller: bool) -> Result<OwnerReference> {
    let uid = host.uid().ok_or_else(|| {
        RunnerError::Configuration(format!("Host {} has no uid", host.name_any()))
    })?;

    Ok(OwnerReference {
        api_version: Pod::api_version(&()).to_string(),
        kind: Pod::kind(&()).to_string(),
        name: host.name_any(),
        uid,
        controller: Some(controller),
        block_owner_deletion: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn annotated(value: Option<&str>) -> Pod {
        let annotations = value.map(|v| BTreeMap::from([(ANNOTATION_TYPE.to_string(), v.to_string())]));
        Pod {
            metadata: ObjectMeta {
                name: Some("runner-0".into()),
                uid: Some("uid-0".into()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(host_role(&annotated(Some("controller"))).unwrap(), HostRole::Controller);
        assert_eq!(host_role(&annotated(Some("client"))).unwrap(), HostRole::Client);

        for bad in [Some("Client"), Some(""), Some("worker"), None] {
            assert!(matches!(
                host_role(&annotated(bad)),
                Err(RunnerError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_readiness() {
        let mut pod = annotated(Some("client"));
        assert!(!is_host_ready(&pod));

        pod.status = Some(PodStatus {
            phase: Some("Running".into()),
            container_statuses: Some(vec![ContainerStatus {
                ready: false,
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(!is_host_ready(&pod));

        if let Some(status) = pod.status.as_mut() {
            status.container_statuses = Some(vec![
                ContainerStatus::default(),
                ContainerStatus {
                    ready: true,
                    ..Default::default()
                },
            ]);
        }
        assert!(is_host_ready(&pod));

        if let Some(status) = pod.status.as_mut() {
            status.phase = Some("Pending".into());
        }
        assert!(!is_host_ready(&pod));
    }

    #[test]
    fn test_owner_reference() {
        let owner = host_owner_reference(&annotated(None), true).unwrap();
        assert_eq!(owner.kind, "Pod");
        assert_eq!(owner.api_version, "v1");
        assert_eq!(owner.name, "runner-0");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_bot_spec_wire_format() {
        let bot: BotSpec = serde_json::from_value(serde_json::json!({
            "code": { "fromRepo": { "address": "https://git.example.com/bots/greeter.git", "ref": "main", "depth": 1 } },
            "commands": [
                { "spec": { "name": "ping", "description": "pong", "code": { "fromString": { "value": "reply('pong')" } } } }
            ],
            "messageHooks": [
                { "spec": { "regex": "^hello", "code": { "fromString": { "value": "wave()" } } },
                  "reference": { "name": "hello-hook" } }
            ]
        }))
        .unwrap();

        assert!(matches!(bot.code, BotCode::FromRepo(ref src) if src.reference == "main" && src.depth == Some(1)));
        assert_eq!(bot.commands[0].spec.code.inline(), Some("reply('pong')"));
        assert_eq!(bot.message_hooks[0].reference.as_ref().unwrap().name, "hello-hook");
        assert!(bot.webhooks.is_empty());
    }
}
