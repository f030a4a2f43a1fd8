// src/sandbox/capability.rs
//! The only handle a bot gets to host resources
//!
//! Filesystem access is confined to the bot's own [`VirtualFilesystem`] and
//! network access to name resolution plus outbound HTTP/S through the
//! filtered client. Bots may act only as network clients.

use crate::sandbox::http::SandboxedHttpClient;
use crate::sandbox::resolver::FilteredResolver;
use crate::sandbox::vfs::VirtualFilesystem;
use crate::utils::errors::{Result, RunnerError};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

pub struct SandboxCapabilities {
    bot: String,
    fs: VirtualFilesystem,
    resolver: FilteredResolver,
    http: SandboxedHttpClient,
}

impl SandboxCapabilities {
    pub fn new(bot: impl Into<String>, fs: VirtualFilesystem, resolver: FilteredResolver) -> Self {
        let http = SandboxedHttpClient::new(resolver.clone());
        Self {
            bot: bot.into(),
            fs,
            resolver,
            http,
        }
    }

    pub fn bot(&self) -> &str {
        &self.bot
    }

    pub fn filesystem(&self) -> &VirtualFilesystem {
        &self.fs
    }

    pub fn read_file(&self, path: &str) -> Result<&[u8]> {
        self.fs.read_file(path)
    }

    pub fn write_file(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<()> {
        self.fs.write_file(path, contents)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        self.fs.list_dir(path)
    }

    /// Resolve `host` to public addresses only
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.resolver.resolve_address(host).await
    }

    pub async fn request(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        self.http.request(request).await
    }

    pub async fn get(&self, uri: &str) -> Result<Response<Bytes>> {
        self.http.get(uri).await
    }

    pub async fn open_listener(&self, addr: SocketAddr) -> Result<TcpListener> {
        Err(self.deny(format!("listen on {}", addr)))
    }

    pub async fn create_server(&self, addr: SocketAddr) -> Result<TcpListener> {
        Err(self.deny(format!("serve on {}", addr)))
    }

    /// Raw sockets bypass the HTTP/S policy
    pub async fn connect_socket(&self, addr: SocketAddr) -> Result<TcpStream> {
        Err(self.deny(format!("open a raw socket to {}", addr)))
    }

    fn deny(&self, action: String) -> RunnerError {
        warn!(bot = %self.bot, action = %action, "Denied sandbox capability");
        RunnerError::SandboxCapabilityDenied(format!("bot {} may not {}", self.bot, action))
    }
}
