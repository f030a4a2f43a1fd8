// src/runtime/worker.rs
//! Bot worker processes
//!
//! Each bot runs in its own OS process: the current binary re-executed with
//! `RUNNER_ROLE=bot`. The launcher writes the bot's filesystem snapshot as one
//! JSON line to the child's stdin and treats an `online` line on its stdout as the
//! startup signal. A supervisor task owns the child afterwards and reports
//! its exit back to the reconciliation loop.

use crate::runtime::limits::CgroupLimiter;
use crate::runtime::process::{current_executable, terminate};
use crate::sandbox::vfs::VfsSnapshot;
use crate::utils::config::ReconcilerConfig;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ENV_ROLE: &str = "RUNNER_ROLE";
pub const ENV_BOT_NAME: &str = "BOT_NAME";
pub const ENV_BOT_NAMESPACE: &str = "BOT_NAMESPACE";
pub const ENV_BOT_API_VERSION: &str = "BOT_API_VERSION";

/// Value of [`ENV_ROLE`] that selects bot mode
pub const ROLE_BOT: &str = "bot";

/// Line a worker prints once it is ready
pub const ONLINE_SIGNAL: &str = "online";

/// Everything needed to start one bot
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub bot: String,
    pub namespace: String,
    pub api_version: String,
    /// Distinguishes successive workers for the same bot
    pub instance: u64,
    pub snapshot: VfsSnapshot,
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own
    Exited { code: Option<i32> },
    /// The runner stopped it
    Stopped,
    /// Supervision failed
    Failed(String),
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            ExitOutcome::Exited { code: None } => write!(f, "killed by signal"),
            ExitOutcome::Stopped => write!(f, "stopped"),
            ExitOutcome::Failed(reason) => write!(f, "supervision failed: {}", reason),
        }
    }
}

/// Exit notification delivered to the reconciliation loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub bot: String,
    pub instance: u64,
    pub outcome: ExitOutcome,
}

/// Handle to a running worker
pub struct Worker {
    bot: String,
    instance: u64,
    stop: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl Worker {
    /// `supervisor` must finish promptly once `stop` is cancelled
    pub fn new(bot: impl Into<String>, instance: u64, stop: CancellationToken, supervisor: JoinHandle<()>) -> Self {
        Self {
            bot: bot.into(),
            instance,
            stop,
            supervisor,
        }
    }

    pub fn bot(&self) -> &str {
        &self.bot
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Stop the worker and wait for its supervisor to finish
    pub async fn terminate(self) {
        self.stop.cancel();
        if let Err(e) = self.supervisor.await {
            warn!(bot = %self.bot, error = %e, "Worker supervisor panicked");
        }
    }
}

/// Starts bot workers
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker and wait until it is online
    ///
    /// The eventual exit is reported on `exits`.
    async fn launch(&self, request: LaunchRequest, exits: mpsc::UnboundedSender<WorkerExit>) -> Result<Worker>;
}

/// Launches workers as child processes of this binary
pub struct ProcessLauncher {
    executable: PathBuf,
    startup_timeout: Duration,
    kill_grace: Duration,
    limiter: Option<CgroupLimiter>,
}

impl ProcessLauncher {
    pub fn new(executable: PathBuf, startup_timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            executable,
            startup_timeout,
            kill_grace,
            limiter: None,
        }
    }

    pub fn from_config(config: &ReconcilerConfig) -> Result<Self> {
        Ok(Self::new(
            current_executable()?,
            Duration::from_millis(config.worker_startup_timeout_ms),
            Duration::from_millis(config.worker_kill_grace_ms),
        ))
    }

    pub fn with_limiter(mut self, limiter: Option<CgroupLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    async fn start(&self, request: &LaunchRequest) -> Result<(Child, Lines<BufReader<ChildStdout>>)> {
        let mut child = Command::new(&self.executable)
            .env(ENV_ROLE, ROLE_BOT)
            .env(ENV_BOT_NAME, &request.bot)
            .env(ENV_BOT_NAMESPACE, &request.namespace)
            .env(ENV_BOT_API_VERSION, &request.api_version)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(limiter), Some(pid)) = (&self.limiter, child.id()) {
            if let Err(e) = limiter.apply(&group_name(request), pid) {
                warn!(bot = %request.bot, error = %e, "Running worker without resource limits");
            }
        }

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::bot_startup(&request.bot, "worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::bot_startup(&request.bot, "worker stdout unavailable"))?;

        let mut snapshot = serde_json::to_vec(&request.snapshot)?;
        snapshot.push(b'\n');
        stdin.write_all(&snapshot).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await? {
                Some(line) if line.trim() == ONLINE_SIGNAL => return Ok((child, lines)),
                Some(line) => debug!(bot = %request.bot, output = %line, "Worker output before online"),
                None => {
                    let status = child.wait().await?;
                    return Err(RunnerError::bot_startup(
                        &request.bot,
                        format!("worker exited before coming online ({})", status),
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest, exits: mpsc::UnboundedSender<WorkerExit>) -> Result<Worker> {
        let started = tokio::time::timeout(self.startup_timeout, self.start(&request)).await;

        let (mut child, mut lines) = match started {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                self.cleanup(&request);
                return Err(match e {
                    RunnerError::BotStartup { .. } => e,
                    other => RunnerError::bot_startup(&request.bot, other),
                });
            }
            Err(_) => {
                // kill_on_drop reaps the child
                self.cleanup(&request);
                return Err(RunnerError::bot_startup(
                    &request.bot,
                    format!("not online within {:?}", self.startup_timeout),
                ));
            }
        };

        info!(bot = %request.bot, instance = request.instance, pid = ?child.id(), "Bot worker online");

        let stop = CancellationToken::new();
        let supervisor = {
            let stop = stop.clone();
            let grace = self.kill_grace;
            let limiter = self.limiter.clone();
            let bot = request.bot.clone();
            let instance = request.instance;
            let group = group_name(&request);

            tokio::spawn(async move {
                let mut stdout_open = true;
                let outcome = loop {
                    tokio::select! {
                        _ = stop.cancelled() => {
                            break match terminate(&mut child, grace).await {
                                Ok(_) => ExitOutcome::Stopped,
                                Err(e) => ExitOutcome::Failed(e.to_string()),
                            };
                        }
                        status = child.wait() => {
                            break match status {
                                Ok(status) => ExitOutcome::Exited { code: status.code() },
                                Err(e) => ExitOutcome::Failed(e.to_string()),
                            };
                        }
                        line = lines.next_line(), if stdout_open => match line {
                            Ok(Some(line)) => debug!(bot = %bot, output = %line, "Worker output"),
                            Ok(None) | Err(_) => stdout_open = false,
                        },
                    }
                };

                if let Some(limiter) = &limiter {
                    limiter.cleanup(&group);
                }

                let _ = exits.send(WorkerExit { bot, instance, outcome });
            })
        };

        Ok(Worker::new(request.bot, request.instance, stop, supervisor))
    }
}

impl ProcessLauncher {
    fn cleanup(&self, request: &LaunchRequest) {
        if let Some(limiter) = &self.limiter {
            limiter.cleanup(&group_name(request));
        }
    }
}

fn group_name(request: &LaunchRequest) -> String {
    format!("{}-{}", request.bot, request.instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        drop(file);

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    fn request(bot: &str) -> LaunchRequest {
        LaunchRequest {
            bot: bot.into(),
            namespace: "ns".into(),
            api_version: "botfleet.dev/v1alpha1".into(),
            instance: 1,
            snapshot: VfsSnapshot::default(),
        }
    }

    fn launcher(path: PathBuf) -> ProcessLauncher {
        ProcessLauncher::new(path, Duration::from_secs(5), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_online_then_stop() {
        let (_dir, path) = script("cat > /dev/null\n[ \"$BOT_NAME\" = greeter ] || exit 3\necho online\nexec sleep 30");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker = launcher(path).launch(request("greeter"), tx).await.unwrap();
        assert_eq!(worker.bot(), "greeter");

        worker.terminate().await;
        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.outcome, ExitOutcome::Stopped);
        assert_eq!(exit.instance, 1);
    }

    #[tokio::test]
    async fn test_exit_is_reported() {
        let (_dir, path) = script("cat > /dev/null\necho online\nexit 4");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _worker = launcher(path).launch(request("greeter"), tx).await.unwrap();
        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.outcome, ExitOutcome::Exited { code: Some(4) });
    }

    #[tokio::test]
    async fn test_exit_before_online_is_startup_error() {
        let (_dir, path) = script("exit 1");
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = launcher(path).launch(request("greeter"), tx).await;
        assert!(matches!(result, Err(RunnerError::BotStartup { .. })));
    }

    #[tokio::test]
    async fn test_missing_executable_is_startup_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = launcher(PathBuf::from("/nonexistent/worker"))
            .launch(request("greeter"), tx)
            .await;
        assert!(matches!(result, Err(RunnerError::BotStartup { .. })));
    }
}
