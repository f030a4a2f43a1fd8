// src/runtime/process.rs
//! Child process control

use crate::utils::errors::{Result, RunnerError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

/// Path of the running binary, used to re-execute it as a bot worker
pub fn current_executable() -> Result<PathBuf> {
    std::env::current_exe()
        .map_err(|e| RunnerError::Configuration(format!("Cannot locate own executable: {}", e)))
}

/// Whether a process with `pid` still exists
pub fn is_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Stop `child`: SIGTERM, then SIGKILL once `grace` has passed
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(child.wait().await?);
    };

    debug!(pid, "Sending SIGTERM");
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            debug!(pid, "Process still alive, sending SIGKILL");
            child.start_kill()?;
            Ok(child.wait().await?)
        }
    }
}
