// src/sandbox/http.rs
//! Outbound HTTP/HTTPS client for bots
//!
//! Requests resolve their target through [`FilteredResolver`] before any
//! socket is opened, and the connector itself uses the same resolver so a
//! request cannot reach an address the preflight did not vet.

use crate::sandbox::resolver::FilteredResolver;
use crate::utils::errors::{Result, RunnerError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

type SandboxConnector = HttpsConnector<HttpConnector<FilteredResolver>>;

/// HTTP/S client bound to a bot's network policy
#[derive(Clone)]
pub struct SandboxedHttpClient {
    resolver: FilteredResolver,
    client: Client<SandboxConnector, Full<Bytes>>,
}

impl SandboxedHttpClient {
    pub fn new(resolver: FilteredResolver) -> Self {
        let mut http = HttpConnector::new_with_resolver(resolver.clone());
        http.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(https);

        Self { resolver, client }
    }

    /// Check that `uri` may be contacted at all
    pub async fn preflight(&self, uri: &Uri) -> Result<()> {
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            other => {
                return Err(RunnerError::SandboxNetworkViolation(format!(
                    "Unsupported scheme {:?} in {}",
                    other, uri
                )))
            }
        }

        let host = uri
            .host()
            .ok_or_else(|| RunnerError::SandboxNetworkViolation(format!("No host in {}", uri)))?;

        self.resolver.resolve_address(host).await?;
        Ok(())
    }

    /// Send a request and collect the response body
    pub async fn request(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        self.preflight(request.uri()).await?;

        debug!(method = %request.method(), uri = %request.uri(), "Sandboxed request");

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| RunnerError::SandboxNetworkViolation(format!("Request failed: {}", e)))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| RunnerError::SandboxNetworkViolation(format!("Response body error: {}", e)))?
            .to_bytes();

        Ok(Response::from_parts(parts, body))
    }

    /// Convenience GET
    pub async fn get(&self, uri: &str) -> Result<Response<Bytes>> {
        let request = Request::get(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| RunnerError::SandboxNetworkViolation(format!("Invalid request: {}", e)))?;
        self.request(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::address::AddressPolicy;
    use crate::sandbox::resolver::StaticLookup;
    use std::sync::Arc;

    fn client() -> SandboxedHttpClient {
        let lookup = StaticLookup::new()
            .with_host("metadata.internal", vec!["169.254.169.254".parse().unwrap()])
            .with_host("db.internal", vec!["10.1.2.3".parse().unwrap()]);
        SandboxedHttpClient::new(FilteredResolver::new(
            Arc::new(lookup),
            AddressPolicy::with_defaults(),
        ))
    }

    #[tokio::test]
    async fn test_local_targets_fail_before_connecting() {
        let client = client();
        for uri in [
            "http://metadata.internal/latest/meta-data",
            "https://db.internal:5432/",
            "http://127.0.0.1:8080/",
            "http://[::1]/",
            "http://192.168.0.10/",
        ] {
            let err = client.get(uri).await.unwrap_err();
            assert!(
                matches!(err, RunnerError::SandboxNetworkViolation(_)),
                "{} -> {:?}",
                uri,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_non_http_scheme_rejected() {
        let uri: Uri = "ftp://example.com/file".parse().unwrap();
        assert!(client().preflight(&uri).await.is_err());
    }
}
