// src/sandbox/source.rs
//! Remote bot sources
//!
//! [`GitFetcher`] clones a repository over HTTP/S with the `git` binary.
//! The repository host is resolved through the bot's [`FilteredResolver`]
//! first, and git is pinned to the vetted address so it cannot re-resolve
//! the name to something local.

use crate::cluster::resources::RemoteSource;
use crate::sandbox::resolver::FilteredResolver;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use hyper::Uri;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Files fetched from a remote source, as `(absolute path, contents)`
pub type SourceTree = Vec<(String, Vec<u8>)>;

/// Bounds on what a checkout may bring into a bot's filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLimits {
    pub max_file_bytes: usize,
    pub max_total_bytes: usize,
    /// Files and directories together
    pub max_entries: usize,
}

/// Fetches the contents of a remote source
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &RemoteSource) -> Result<SourceTree>;
}

/// Shallow `git clone` into a temporary directory
pub struct GitFetcher {
    resolver: FilteredResolver,
    git_binary: Option<String>,
    default_depth: u32,
    limits: TreeLimits,
}

impl GitFetcher {
    pub fn new(resolver: FilteredResolver, git_binary: Option<String>, default_depth: u32, limits: TreeLimits) -> Self {
        Self {
            resolver,
            git_binary,
            default_depth: default_depth.max(1),
            limits,
        }
    }

    fn git(&self) -> Result<PathBuf> {
        match &self.git_binary {
            Some(path) => Ok(PathBuf::from(path)),
            None => which::which("git")
                .map_err(|e| RunnerError::Configuration(format!("git not found in PATH: {}", e))),
        }
    }

    /// Validate the address and resolve its host to a public address
    async fn vet(&self, address: &str) -> Result<(Uri, String, u16, IpAddr)> {
        let uri: Uri = address.parse().map_err(|e| {
            RunnerError::SandboxNetworkViolation(format!("Invalid source address {}: {}", address, e))
        })?;

        let port = match uri.scheme_str() {
            Some("https") => uri.port_u16().unwrap_or(443),
            Some("http") => uri.port_u16().unwrap_or(80),
            other => {
                return Err(RunnerError::SandboxNetworkViolation(format!(
                    "Source scheme {:?} is not allowed",
                    other
                )))
            }
        };

        let host = uri
            .host()
            .ok_or_else(|| RunnerError::SandboxNetworkViolation(format!("No host in {}", address)))?
            .to_string();

        let addrs = self.resolver.resolve_address(&host).await?;
        let pinned = addrs.into_iter().next().ok_or_else(|| {
            RunnerError::SandboxNetworkViolation(format!("{} has no usable address", host))
        })?;

        Ok((uri, host, port, pinned))
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, source: &RemoteSource) -> Result<SourceTree> {
        let (uri, host, port, pinned) = self.vet(&source.address).await?;
        let git = self.git()?;
        let depth = source.depth.unwrap_or(self.default_depth).max(1);

        let checkout = tempfile::tempdir()?;
        let target = checkout.path().join("src");

        let pin = match pinned {
            IpAddr::V4(v4) => format!("{}:{}:{}", host.trim_matches(['[', ']']), port, v4),
            IpAddr::V6(v6) => format!("{}:{}:[{}]", host.trim_matches(['[', ']']), port, v6),
        };

        debug!(source = %uri, reference = %source.reference, depth, pinned = %pinned, "Cloning bot source");

        let output = Command::new(git)
            .arg("-c")
            .arg(format!("http.curloptResolve={}", pin))
            .args(["-c", "http.followRedirects=false"])
            .args(["-c", "protocol.allow=never"])
            .args(["-c", "protocol.http.allow=always"])
            .args(["-c", "protocol.https.allow=always"])
            .arg("clone")
            .arg("--quiet")
            .arg("--single-branch")
            .arg("--depth")
            .arg(depth.to_string())
            .arg("--branch")
            .arg(&source.reference)
            .arg("--")
            .arg(uri.to_string())
            .arg(&target)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(RunnerError::SandboxFilesystem(format!(
                "git clone of {}@{} failed: {}",
                uri,
                source.reference,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let limits = self.limits;
        let tree = tokio::task::spawn_blocking(move || collect_tree(&target, &limits))
            .await
            .map_err(|e| RunnerError::SandboxFilesystem(format!("Source walk panicked: {}", e)))??;

        info!(source = %uri, files = tree.len(), "Fetched bot source");
        Ok(tree)
    }
}

/// Read every regular file under `root`; `.git` and symlinks are skipped
///
/// Fails as soon as a file, the running total or the entry count goes over
/// `limits`.
pub fn collect_tree(root: &Path, limits: &TreeLimits) -> Result<SourceTree> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    let mut entries = 0usize;
    let mut total_bytes = 0usize;

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();

            if file_type.is_symlink() || entry.file_name() == ".git" {
                continue;
            }

            entries += 1;
            if entries > limits.max_entries {
                return Err(RunnerError::SandboxFilesystem(format!(
                    "source has more than {} entries",
                    limits.max_entries
                )));
            }

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }

            let relative = path.strip_prefix(root).map_err(|e| {
                RunnerError::SandboxFilesystem(format!("{} escaped the checkout: {}", path.display(), e))
            })?;

            let size = entry.metadata()?.len() as usize;
            if size > limits.max_file_bytes {
                return Err(RunnerError::SandboxFilesystem(format!(
                    "{} exceeds {} bytes",
                    relative.display(),
                    limits.max_file_bytes
                )));
            }

            total_bytes = total_bytes.saturating_add(size);
            if total_bytes > limits.max_total_bytes {
                return Err(RunnerError::SandboxFilesystem(format!(
                    "source is larger than {} bytes",
                    limits.max_total_bytes
                )));
            }

            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            files.push((format!("/{}", name), std::fs::read(&path)?));
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::address::AddressPolicy;
    use crate::sandbox::resolver::StaticLookup;
    use std::sync::Arc;

    fn fetcher(lookup: StaticLookup) -> GitFetcher {
        let resolver = FilteredResolver::new(Arc::new(lookup), AddressPolicy::with_defaults());
        GitFetcher::new(resolver, Some("/nonexistent/git".into()), 1, limits(1024, 4096, 64))
    }

    fn limits(max_file_bytes: usize, max_total_bytes: usize, max_entries: usize) -> TreeLimits {
        TreeLimits {
            max_file_bytes,
            max_total_bytes,
            max_entries,
        }
    }

    fn source(address: &str) -> RemoteSource {
        RemoteSource {
            address: address.into(),
            reference: "main".into(),
            depth: None,
        }
    }

    #[tokio::test]
    async fn test_private_source_fails_closed() {
        let lookup = StaticLookup::new().with_host("git.internal", vec!["10.1.2.3".parse().unwrap()]);
        let result = fetcher(lookup).fetch(&source("https://git.internal/bot.git")).await;
        assert!(matches!(result, Err(RunnerError::SandboxNetworkViolation(_))));
    }

    #[tokio::test]
    async fn test_loopback_literal_fails_closed() {
        let result = fetcher(StaticLookup::new())
            .fetch(&source("http://127.0.0.1:3000/bot.git"))
            .await;
        assert!(matches!(result, Err(RunnerError::SandboxNetworkViolation(_))));
    }

    #[tokio::test]
    async fn test_non_http_schemes_rejected() {
        for address in ["file:///etc", "ssh://git@example.com/bot.git"] {
            let result = fetcher(StaticLookup::new()).fetch(&source(address)).await;
            assert!(
                matches!(result, Err(RunnerError::SandboxNetworkViolation(_))),
                "{} was accepted",
                address
            );
        }
    }

    #[test]
    fn test_collect_tree_skips_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("index.js"), "main").unwrap();
        std::fs::write(dir.path().join("lib/util.js"), "util").unwrap();

        let tree = collect_tree(dir.path(), &limits(1024, 4096, 64)).unwrap();
        let paths: Vec<&str> = tree.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/index.js", "/lib/util.js"]);
        assert_eq!(tree[0].1, b"main");
    }

    #[test]
    fn test_collect_tree_enforces_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![0u8; 64]).unwrap();
        assert!(matches!(
            collect_tree(dir.path(), &limits(16, 4096, 64)),
            Err(RunnerError::SandboxFilesystem(_))
        ));
    }

    #[test]
    fn test_collect_tree_enforces_total_size() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            std::fs::write(dir.path().join(format!("part{}.bin", i)), vec![0u8; 100]).unwrap();
        }

        assert_eq!(collect_tree(dir.path(), &limits(100, 400, 64)).unwrap().len(), 4);
        assert!(matches!(
            collect_tree(dir.path(), &limits(100, 399, 64)),
            Err(RunnerError::SandboxFilesystem(_))
        ));
    }

    #[test]
    fn test_collect_tree_enforces_entry_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/one"), "1").unwrap();
        std::fs::write(dir.path().join("two"), "2").unwrap();

        // a, a/b, a/b/one, two
        assert_eq!(collect_tree(dir.path(), &limits(16, 64, 4)).unwrap().len(), 2);
        assert!(matches!(
            collect_tree(dir.path(), &limits(16, 64, 3)),
            Err(RunnerError::SandboxFilesystem(_))
        ));
    }
}
