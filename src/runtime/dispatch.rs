// src/runtime/dispatch.rs
//! Handler dispatch inside a bot worker
//!
//! A worker's handlers are read back out of its own filesystem through the
//! capability handle: `/main` plus one file per entry under `/commands`,
//! `/messageHooks` and `/webhooks`. `/main` runs once at startup; events
//! arrive as JSON lines after the snapshot on stdin and go to the handler
//! at the path they name. A [`HandlerEngine`] does the actual running.

use crate::runtime::worker::ENV_BOT_NAME;
use crate::sandbox::capability::SandboxCapabilities;
use crate::sandbox::runtime::{hook_fingerprint, COMMANDS_DIR, MAIN_PATH, MESSAGE_HOOKS_DIR, WEBHOOKS_DIR};
use crate::sandbox::vfs::NodeKind;
use crate::utils::config::SandboxSettings;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const ENV_BOT_HANDLER: &str = "BOT_HANDLER";
pub const ENV_BOT_EVENT: &str = "BOT_EVENT";

/// Something a bot reacts to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BotEvent {
    Command {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A chat message that matched the hook registered for `pattern`
    Message { pattern: String, text: String },
    Webhook {
        id: String,
        #[serde(default)]
        body: serde_json::Value,
    },
}

impl BotEvent {
    /// Path of the handler this event is routed to
    pub fn handler_path(&self) -> String {
        match self {
            BotEvent::Command { name, .. } => format!("{}/{}", COMMANDS_DIR, name),
            BotEvent::Message { pattern, .. } => format!("{}/{}", MESSAGE_HOOKS_DIR, hook_fingerprint(pattern)),
            BotEvent::Webhook { id, .. } => format!("{}/{}", WEBHOOKS_DIR, id),
        }
    }
}

/// One handler run
#[derive(Debug, Clone)]
pub struct Invocation {
    pub path: String,
    pub source: Vec<u8>,
    pub input: serde_json::Value,
    pub timeout: Option<Duration>,
}

/// Runs handler source
#[async_trait]
pub trait HandlerEngine: Send + Sync {
    async fn invoke(&self, caps: &SandboxCapabilities, invocation: Invocation) -> Result<()>;
}

/// Handler paths present in a bot's filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerTable {
    main: bool,
    handlers: BTreeSet<String>,
}

impl HandlerTable {
    pub fn load(caps: &SandboxCapabilities) -> Result<Self> {
        let fs = caps.filesystem();
        let mut handlers = BTreeSet::new();

        for dir in [COMMANDS_DIR, MESSAGE_HOOKS_DIR, WEBHOOKS_DIR] {
            if fs.kind(dir) != Some(NodeKind::Directory) {
                continue;
            }
            for name in caps.list_dir(dir)? {
                let path = format!("{}/{}", dir, name);
                if fs.kind(&path) == Some(NodeKind::File) {
                    handlers.insert(path);
                }
            }
        }

        Ok(Self {
            main: fs.kind(MAIN_PATH) == Some(NodeKind::File),
            handlers,
        })
    }

    pub fn has_main(&self) -> bool {
        self.main
    }

    pub fn contains(&self, path: &str) -> bool {
        self.handlers.contains(path)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Routes events to a bot's handlers
pub struct Dispatcher {
    caps: Arc<SandboxCapabilities>,
    table: HandlerTable,
    engine: Arc<dyn HandlerEngine>,
    handler_timeout: Duration,
}

impl Dispatcher {
    pub fn new(caps: SandboxCapabilities, engine: Arc<dyn HandlerEngine>, handler_timeout: Duration) -> Result<Self> {
        let table = HandlerTable::load(&caps)?;
        Ok(Self {
            caps: Arc::new(caps),
            table,
            engine,
            handler_timeout,
        })
    }

    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    /// Run `/main` to completion; `false` when the bot has none
    pub async fn run_main(&self) -> Result<bool> {
        if !self.table.has_main() {
            debug!(bot = %self.caps.bot(), "No main handler");
            return Ok(false);
        }

        let invocation = Invocation {
            path: MAIN_PATH.to_string(),
            source: self.caps.read_file(MAIN_PATH)?.to_vec(),
            input: serde_json::Value::Null,
            timeout: None,
        };
        self.engine.invoke(&self.caps, invocation).await?;
        Ok(true)
    }

    pub async fn dispatch(&self, event: &BotEvent) -> Result<()> {
        let path = event.handler_path();
        if !self.table.contains(&path) {
            return Err(RunnerError::NotFound(format!(
                "bot {} has no handler at {}",
                self.caps.bot(),
                path
            )));
        }

        let invocation = Invocation {
            source: self.caps.read_file(&path)?.to_vec(),
            input: serde_json::to_value(event)?,
            timeout: Some(self.handler_timeout),
            path,
        };

        metrics::counter!("runner_bot_handler_runs_total").increment(1);
        self.engine.invoke(&self.caps, invocation).await
    }

    /// Dispatch every JSON event line from `input` until it ends
    ///
    /// Malformed lines and failed handlers are logged and skipped. Returns the
    /// number of handlers that completed.
    pub async fn dispatch_lines<R>(&self, input: R) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut handled = 0;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let event: BotEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(bot = %self.caps.bot(), error = %e, "Skipping malformed event");
                    continue;
                }
            };

            match self.dispatch(&event).await {
                Ok(()) => handled += 1,
                Err(e) => warn!(
                    bot = %self.caps.bot(),
                    handler = %event.handler_path(),
                    error = %e,
                    "Handler failed"
                ),
            }
        }

        Ok(handled)
    }
}

/// Runs handler source with an external interpreter
///
/// The source is written to the interpreter's stdin. The child sees only
/// `PATH`, the bot name, the handler path and the event as JSON; its output
/// goes to the worker's stderr so stdout stays reserved for the online signal.
pub struct InterpreterEngine {
    command: Vec<String>,
}

impl InterpreterEngine {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(settings.interpreter.clone())
    }
}

#[async_trait]
impl HandlerEngine for InterpreterEngine {
    async fn invoke(&self, caps: &SandboxCapabilities, invocation: Invocation) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| RunnerError::Configuration("sandbox interpreter is empty".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env(ENV_BOT_NAME, caps.bot())
            .env(ENV_BOT_HANDLER, &invocation.path)
            .env(ENV_BOT_EVENT, invocation.input.to_string())
            .stdin(Stdio::piped())
            .stdout(std::io::stderr())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&invocation.source).await?;
            stdin.shutdown().await?;
        }

        info!(bot = %caps.bot(), handler = %invocation.path, "Running handler");

        let status = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    child.kill().await?;
                    return Err(RunnerError::Timeout(format!(
                        "handler {} ran longer than {:?}",
                        invocation.path, limit
                    )));
                }
            },
            None => child.wait().await?,
        };

        if !status.success() {
            return Err(RunnerError::Handler(format!("{} exited with {}", invocation.path, status)));
        }
        Ok(())
    }
}
