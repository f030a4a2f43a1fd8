// src/sandbox/resolver.rs
//! Filtered name resolution
//!
//! Every hostname a bot touches goes through [`FilteredResolver`], which drops
//! local addresses and fails when nothing public remains. The resolver also
//! plugs into hyper's connector so HTTP/S requests cannot bypass the filter.

use crate::sandbox::address::AddressPolicy;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use hyper_util::client::legacy::connect::dns::Name;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};
use trust_dns_resolver::TokioAsyncResolver;

/// Raw name lookup (before filtering)
#[async_trait]
pub trait NameLookup: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Lookup backed by the system resolver configuration
pub struct SystemLookup {
    resolver: TokioAsyncResolver,
}

impl SystemLookup {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            RunnerError::Configuration(format!("Failed to load resolver configuration: {}", e))
        })?;

        Ok(Self { resolver })
    }
}

#[async_trait]
impl NameLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| RunnerError::NameResolution(format!("{}: {}", host, e)))?;

        Ok(response.iter().collect())
    }
}

/// Fixed host table
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, addrs: Vec<IpAddr>) -> Self {
        self.entries.insert(host.into().to_ascii_lowercase(), addrs);
        self
    }
}

#[async_trait]
impl NameLookup for StaticLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RunnerError::NameResolution(format!("{}: no such host", host)))
    }
}

/// Resolver that only ever yields public addresses
#[derive(Clone)]
pub struct FilteredResolver {
    lookup: Arc<dyn NameLookup>,
    policy: Arc<AddressPolicy>,
}

impl FilteredResolver {
    pub fn new(lookup: Arc<dyn NameLookup>, policy: AddressPolicy) -> Self {
        Self {
            lookup,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    /// Resolve `host`, discarding local addresses
    pub async fn resolve_address(&self, host: &str) -> Result<Vec<IpAddr>> {
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let candidates = match host.parse::<IpAddr>() {
            Ok(literal) => vec![literal],
            Err(_) => self.lookup.lookup(host).await?,
        };

        let total = candidates.len();
        let public: Vec<IpAddr> = candidates
            .into_iter()
            .filter(|addr| !self.policy.is_local(*addr))
            .collect();

        if public.is_empty() {
            warn!(host, resolved = total, "Blocked resolution to local addresses");
            return Err(RunnerError::SandboxNetworkViolation(format!(
                "{} does not resolve to any public address",
                host
            )));
        }

        debug!(host, public = public.len(), dropped = total - public.len(), "Resolved host");
        Ok(public)
    }
}

impl tower::Service<Name> for FilteredResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = RunnerError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.clone();
        Box::pin(async move {
            let addrs = resolver.resolve_address(name.as_str()).await?;
            Ok(addrs
                .into_iter()
                .map(|ip| SocketAddr::new(ip, 0))
                .collect::<Vec<_>>()
                .into_iter())
        })
    }
}
