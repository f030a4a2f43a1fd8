// src/cluster/api.rs
//! Cluster API seam
//!
//! Everything the runner needs from the orchestration API goes through
//! [`ClusterApi`]: host reads/creates, BotRunner CRUD + watch, and Bot reads.

use crate::cluster::resources::{Bot, BotRunner};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;

/// One page of a paginated list call
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,

    /// Token for the next page
    pub continue_token: Option<String>,

    /// Items the server reports as not yet returned, when it knows
    pub remaining: Option<i64>,
}

impl<T> Page<T> {
    /// Continuation token to request next, if more items remain
    pub fn next_token(&self) -> Option<String> {
        let token = self.continue_token.as_ref().filter(|t| !t.is_empty())?;
        match self.remaining {
            Some(remaining) if remaining <= 0 => None,
            _ => Some(token.clone()),
        }
    }
}

/// Operations the runner performs against the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self, namespace: &str, continue_token: Option<String>) -> Result<Page<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    async fn list_runners(
        &self,
        namespace: &str,
        continue_token: Option<String>,
    ) -> Result<Page<BotRunner>>;

    async fn get_runner(&self, namespace: &str, name: &str) -> Result<BotRunner>;

    async fn create_runner(&self, namespace: &str, runner: &BotRunner) -> Result<BotRunner>;

    async fn delete_runner(&self, namespace: &str, name: &str) -> Result<()>;

    /// Overwrite `spec.bots` and nothing else
    ///
    /// With `resource_version` set the write only applies if the stored
    /// object still has that version; otherwise it fails with `Conflict`.
    async fn patch_runner_bots(
        &self,
        namespace: &str,
        name: &str,
        bots: &[String],
        resource_version: Option<&str>,
    ) -> Result<BotRunner>;

    async fn get_bot(&self, namespace: &str, name: &str) -> Result<Bot>;

    /// Ordered stream of the named BotRunner's states (current state first)
    fn watch_runner(&self, namespace: &str, name: &str) -> BoxStream<'static, Result<BotRunner>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(token: Option<&str>, remaining: Option<i64>) -> Page<()> {
        Page {
            items: vec![],
            continue_token: token.map(str::to_string),
            remaining,
        }
    }

    #[test]
    fn test_next_token() {
        assert_eq!(page(Some("abc"), Some(3)).next_token().as_deref(), Some("abc"));
        assert_eq!(page(Some("abc"), None).next_token().as_deref(), Some("abc"));
        assert_eq!(page(Some("abc"), Some(0)).next_token(), None);
        assert_eq!(page(Some(""), Some(5)).next_token(), None);
        assert_eq!(page(None, Some(5)).next_token(), None);
    }
}
