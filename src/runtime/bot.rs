// src/runtime/bot.rs
//! Bot worker entry
//!
//! A worker reads its filesystem snapshot from the first line of stdin,
//! builds the sandbox capabilities, reports `online` on stdout, runs `/main`
//! and dispatches the event lines that follow the snapshot until it receives
//! SIGTERM. Logs go to stderr; stdout carries only the online signal.

use crate::runtime::dispatch::{Dispatcher, InterpreterEngine};
use crate::runtime::worker::{ENV_BOT_API_VERSION, ENV_BOT_NAME, ENV_BOT_NAMESPACE, ONLINE_SIGNAL};
use crate::sandbox::capability::SandboxCapabilities;
use crate::sandbox::runtime::SandboxRuntime;
use crate::sandbox::vfs::{VfsSnapshot, VirtualFilesystem};
use crate::utils::config::RunnerConfig;
use crate::utils::errors::{Result, RunnerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Identity a worker receives through its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub name: String,
    pub namespace: String,
    pub api_version: String,
}

impl BotIdentity {
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| RunnerError::Configuration(format!("{} is not set", key)))
        };

        Ok(Self {
            name: required(ENV_BOT_NAME)?,
            namespace: required(ENV_BOT_NAMESPACE)?,
            api_version: required(ENV_BOT_API_VERSION)?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Read the snapshot line and build the bot's capability handle
///
/// Leaves anything after the first line in `input` for event dispatch.
pub async fn prepare<R>(identity: &BotIdentity, sandbox: &SandboxRuntime, input: &mut R) -> Result<SandboxCapabilities>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    input.read_until(b'\n', &mut raw).await?;

    let snapshot: VfsSnapshot = serde_json::from_slice(&raw)?;
    let fs = VirtualFilesystem::from_snapshot(&snapshot, sandbox.max_file_bytes())?;

    Ok(sandbox.capabilities(&identity.name, fs))
}

/// Write the online signal
pub async fn announce_online<W>(output: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(format!("{}\n", ONLINE_SIGNAL).as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

/// Run as a bot worker until terminated
pub async fn run_bot(config: &RunnerConfig) -> Result<()> {
    let identity = BotIdentity::from_env()?;
    let sandbox = SandboxRuntime::from_settings(&config.sandbox)?;

    let mut terminate = signal(SignalKind::terminate())?;

    let mut input = BufReader::new(tokio::io::stdin());
    let capabilities = prepare(&identity, &sandbox, &mut input).await?;
    info!(
        bot = %identity.name,
        namespace = %identity.namespace,
        files = capabilities.filesystem().file_count(),
        "Bot sandbox ready"
    );

    let dispatcher = Arc::new(Dispatcher::new(
        capabilities,
        Arc::new(InterpreterEngine::from_settings(&config.sandbox)),
        Duration::from_millis(config.sandbox.handler_timeout_ms),
    )?);
    info!(bot = %identity.name, handlers = dispatcher.table().len(), "Loaded bot handlers");

    announce_online(&mut tokio::io::stdout()).await?;

    let mut main = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run_main().await })
    };
    let events = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch_lines(input).await })
    };

    let result = tokio::select! {
        _ = terminate.recv() => Ok(()),
        _ = tokio::signal::ctrl_c() => Ok(()),
        finished = &mut main => match finished {
            Ok(Ok(_)) => {
                info!(bot = %identity.name, "Main handler finished");
                tokio::select! {
                    _ = terminate.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                Ok(())
            }
            Ok(Err(e)) => {
                error!(bot = %identity.name, error = %e, "Main handler failed");
                Err(e)
            }
            Err(e) => {
                warn!(bot = %identity.name, error = %e, "Main handler task ended abnormally");
                Err(RunnerError::Handler(format!("main task: {}", e)))
            }
        },
    };

    main.abort();
    events.abort();
    info!(bot = %identity.name, "Bot worker shutting down");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::resolver::StaticLookup;
    use crate::utils::config::SandboxSettings;
    use std::collections::HashMap;

    fn identity() -> BotIdentity {
        BotIdentity {
            name: "greeter".into(),
            namespace: "ns".into(),
            api_version: "botfleet.dev/v1alpha1".into(),
        }
    }

    #[test]
    fn test_identity_from_env() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BOT_NAME", "greeter"),
            ("BOT_NAMESPACE", "ns"),
            ("BOT_API_VERSION", "botfleet.dev/v1alpha1"),
        ]);
        let parsed = BotIdentity::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(parsed, identity());

        let missing = BotIdentity::from_lookup(|_| None);
        assert!(matches!(missing, Err(RunnerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_prepare_restores_filesystem() {
        let mut fs = VirtualFilesystem::new(1024);
        fs.write_file("/main", "hello()").unwrap();
        let raw = serde_json::to_vec(&fs.snapshot()).unwrap();

        let sandbox = SandboxRuntime::with_lookup(&SandboxSettings::default(), Arc::new(StaticLookup::new()));
        let caps = prepare(&identity(), &sandbox, &mut raw.as_slice()).await.unwrap();

        assert_eq!(caps.bot(), "greeter");
        assert_eq!(caps.read_file("/main").unwrap(), b"hello()");
    }

    #[tokio::test]
    async fn test_events_follow_the_snapshot() {
        use crate::runtime::dispatch::{HandlerEngine, Invocation};
        use async_trait::async_trait;
        use parking_lot::Mutex;

        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);

        #[async_trait]
        impl HandlerEngine for Recorder {
            async fn invoke(&self, _caps: &SandboxCapabilities, invocation: Invocation) -> Result<()> {
                self.0.lock().push(invocation.path);
                Ok(())
            }
        }

        let mut fs = VirtualFilesystem::new(1024);
        fs.write_file("/main", "start()").unwrap();
        fs.write_file("/commands/hello", "hello()").unwrap();
        let mut input = serde_json::to_vec(&fs.snapshot()).unwrap();
        input.extend_from_slice(b"\n{\"type\":\"command\",\"name\":\"hello\"}\n");

        let sandbox = SandboxRuntime::with_lookup(&SandboxSettings::default(), Arc::new(StaticLookup::new()));
        let mut reader = input.as_slice();
        let caps = prepare(&identity(), &sandbox, &mut reader).await.unwrap();

        let engine = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(caps, engine.clone(), Duration::from_secs(1)).unwrap();
        assert!(dispatcher.run_main().await.unwrap());
        assert_eq!(dispatcher.dispatch_lines(reader).await.unwrap(), 1);

        assert_eq!(*engine.0.lock(), vec!["/main", "/commands/hello"]);
    }

    #[tokio::test]
    async fn test_announce_online() {
        let mut out = Vec::new();
        announce_online(&mut out).await.unwrap();
        assert_eq!(out, b"online\n");
    }
}
