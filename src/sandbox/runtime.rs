// src/sandbox/runtime.rs
//! Per-bot sandbox assembly
//!
//! [`SandboxRuntime`] turns a `Bot` definition into a fresh
//! [`VirtualFilesystem`] and hands out [`SandboxCapabilities`] bound to the
//! runtime's network policy.
//!
//! Layout of a materialized bot:
//!
//! ```text
//! /                          remote source checkout (if any)
//! /main                      inline bot code
//! /commands/<name>           command handlers
//! /messageHooks/<sha256>     message hooks, keyed by pattern fingerprint
//! /webhooks/<id>             webhook handlers
//! ```

use crate::cluster::resources::{BotCode, BotSpec};
use crate::sandbox::address::{AddressClass, AddressPolicy};
use crate::sandbox::capability::SandboxCapabilities;
use crate::sandbox::resolver::{FilteredResolver, NameLookup, SystemLookup};
use crate::sandbox::source::{GitFetcher, SourceFetcher, TreeLimits};
use crate::sandbox::vfs::VirtualFilesystem;
use crate::utils::config::SandboxSettings;
use crate::utils::errors::{Result, RunnerError};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

pub const MAIN_PATH: &str = "/main";
pub const COMMANDS_DIR: &str = "/commands";
pub const MESSAGE_HOOKS_DIR: &str = "/messageHooks";
pub const WEBHOOKS_DIR: &str = "/webhooks";

/// Lowercase hex SHA-256 of a message-hook pattern
pub fn hook_fingerprint(pattern: &str) -> String {
    hex::encode(Sha256::digest(pattern.as_bytes()))
}

/// Outcome of one materialization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Paths newly written
    pub written: Vec<String>,
    /// Paths left alone: a file was already there or the handler has no inline code
    pub skipped: Vec<String>,
}

pub struct SandboxRuntime {
    resolver: FilteredResolver,
    fetcher: Arc<dyn SourceFetcher>,
    max_file_bytes: usize,
}

impl SandboxRuntime {
    pub fn new(resolver: FilteredResolver, fetcher: Arc<dyn SourceFetcher>, max_file_bytes: usize) -> Self {
        Self {
            resolver,
            fetcher,
            max_file_bytes,
        }
    }

    /// System resolver, git fetcher and the configured blocked ranges
    pub fn from_settings(settings: &SandboxSettings) -> Result<Self> {
        let lookup: Arc<dyn NameLookup> = Arc::new(SystemLookup::from_system_conf()?);
        Ok(Self::with_lookup(settings, lookup))
    }

    pub fn with_lookup(settings: &SandboxSettings, lookup: Arc<dyn NameLookup>) -> Self {
        let policy = AddressPolicy::new(settings.blocked_ranges.clone());
        let resolver = FilteredResolver::new(lookup, policy);
        let fetcher = Arc::new(GitFetcher::new(
            resolver.clone(),
            settings.git_binary.clone(),
            settings.clone_depth,
            TreeLimits {
                max_file_bytes: settings.max_file_bytes,
                max_total_bytes: settings.max_source_bytes,
                max_entries: settings.max_source_entries,
            },
        ));
        Self::new(resolver, fetcher, settings.max_file_bytes)
    }

    pub fn resolver(&self) -> &FilteredResolver {
        &self.resolver
    }

    pub fn max_file_bytes(&self) -> usize {
        self.max_file_bytes
    }

    /// Build a fresh filesystem for `bot`
    pub async fn build_filesystem(&self, bot: &BotSpec) -> Result<VirtualFilesystem> {
        let mut fs = VirtualFilesystem::new(self.max_file_bytes);

        match &bot.code {
            BotCode::FromRepo(source) => {
                for (path, contents) in self.fetcher.fetch(source).await? {
                    fs.write_file(&path, contents)?;
                }
            }
            BotCode::FromString { value } => {
                fs.write_if_absent(MAIN_PATH, value.as_bytes())?;
            }
        }

        let report = self.materialize_entries(&mut fs, bot)?;
        debug!(
            files = fs.file_count(),
            written = report.written.len(),
            skipped = report.skipped.len(),
            "Built bot filesystem"
        );
        Ok(fs)
    }

    /// Write each inline command, hook and webhook to its fixed path
    ///
    /// Existing files are never overwritten, so repeating the call with the
    /// same definition changes nothing.
    pub fn materialize_entries(&self, fs: &mut VirtualFilesystem, bot: &BotSpec) -> Result<MaterializeReport> {
        let mut report = MaterializeReport::default();

        let commands = bot
            .commands
            .iter()
            .map(|entry| (COMMANDS_DIR, segment(&entry.spec.name), &entry.spec.code));
        let hooks = bot
            .message_hooks
            .iter()
            .map(|entry| (MESSAGE_HOOKS_DIR, Ok(hook_fingerprint(&entry.spec.regex)), &entry.spec.code));
        let webhooks = bot
            .webhooks
            .iter()
            .map(|entry| (WEBHOOKS_DIR, segment(&entry.spec.id), &entry.spec.code));

        for (dir, name, code) in commands.chain(hooks).chain(webhooks) {
            let path = format!("{}/{}", dir, name?);
            let Some(source) = code.inline() else {
                debug!(path = %path, "Skipping handler without inline code");
                report.skipped.push(path);
                continue;
            };

            if fs.write_if_absent(&path, source.as_bytes())? {
                report.written.push(path);
            } else {
                report.skipped.push(path);
            }
        }

        Ok(report)
    }

    /// Capability handle for a bot running over `fs`
    pub fn capabilities(&self, bot: &str, fs: VirtualFilesystem) -> SandboxCapabilities {
        SandboxCapabilities::new(bot, fs, self.resolver.clone())
    }

    pub async fn resolve_address(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.resolver.resolve_address(host).await
    }

    pub fn classify_address(&self, addr: IpAddr) -> AddressClass {
        self.resolver.policy().classify(addr)
    }
}

/// A handler name usable as one path segment
fn segment(name: &str) -> Result<String> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(RunnerError::SandboxFilesystem(format!(
            "'{}' is not a valid handler name",
            name
        )));
    }
    Ok(name.to_string())
}
