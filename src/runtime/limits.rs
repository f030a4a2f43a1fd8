// src/runtime/limits.rs
//! CPU, memory and process-count limits for bot workers
//!
//! Limits are enforced with cgroup v2. Each worker gets its own group under
//! `<root>/botfleet-runner/`; hosts without a writable hierarchy run workers
//! unlimited.

use crate::utils::errors::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const GROUP_PARENT: &str = "botfleet-runner";
const CPU_PERIOD_US: u64 = 100_000;

/// Per-worker resource limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU quota as percentage of one core (100 = one full core)
    pub max_cpu_percent: Option<u32>,

    /// Memory limit in megabytes
    pub max_memory_mb: Option<u64>,

    /// Maximum number of tasks in the worker's group
    pub max_processes: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: Some(50),
            max_memory_mb: Some(256),
            max_processes: Some(64),
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            max_cpu_percent: None,
            max_memory_mb: None,
            max_processes: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_cpu_percent.is_none() && self.max_memory_mb.is_none() && self.max_processes.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(cpu) = self.max_cpu_percent {
            if cpu == 0 || cpu > 400 {
                return Err(RunnerError::Configuration(format!(
                    "max_cpu_percent must be within 1..=400, got {}",
                    cpu
                )));
            }
        }

        if let Some(memory) = self.max_memory_mb {
            if memory < 32 {
                return Err(RunnerError::Configuration(format!(
                    "max_memory_mb must be at least 32, got {}",
                    memory
                )));
            }
        }

        if self.max_processes == Some(0) {
            return Err(RunnerError::Configuration("max_processes cannot be 0".into()));
        }

        Ok(())
    }

    /// `(file, value)` pairs to write into a cgroup v2 directory
    fn controller_values(&self) -> Vec<(&'static str, String)> {
        let mut values = Vec::new();

        if let Some(cpu) = self.max_cpu_percent {
            let quota = cpu as u64 * CPU_PERIOD_US / 100;
            values.push(("cpu.max", format!("{} {}", quota, CPU_PERIOD_US)));
        }

        if let Some(memory) = self.max_memory_mb {
            values.push(("memory.max", (memory * 1024 * 1024).to_string()));
        }

        if let Some(processes) = self.max_processes {
            values.push(("pids.max", processes.to_string()));
        }

        values
    }
}

/// Places worker processes into limited cgroups
#[derive(Debug, Clone)]
pub struct CgroupLimiter {
    parent: PathBuf,
    limits: ResourceLimits,
}

impl CgroupLimiter {
    /// Limiter rooted at `root` (normally `/sys/fs/cgroup`)
    pub fn new(root: impl AsRef<Path>, limits: ResourceLimits) -> Self {
        Self {
            parent: root.as_ref().join(GROUP_PARENT),
            limits,
        }
    }

    /// Limiter for this host, when limits are configured and cgroup v2 is writable
    pub fn detect(limits: &ResourceLimits) -> Option<Self> {
        if limits.is_unlimited() {
            return None;
        }

        let root = Path::new(CGROUP_ROOT);
        if !root.join("cgroup.controllers").exists() {
            warn!("cgroup v2 hierarchy not found, bot workers will run without resource limits");
            return None;
        }

        let limiter = Self::new(root, limits.clone());
        if let Err(e) = fs::create_dir_all(&limiter.parent) {
            warn!(error = %e, "cgroup hierarchy is not writable, bot workers will run without resource limits");
            return None;
        }

        // Controllers must be delegated to the parent before children can use them
        delegate_controllers(root);
        delegate_controllers(&limiter.parent);

        Some(limiter)
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn group_path(&self, group: &str) -> PathBuf {
        self.parent.join(group)
    }

    /// Create `group`, write the limits and move `pid` into it
    pub fn apply(&self, group: &str, pid: u32) -> Result<PathBuf> {
        let path = self.group_path(group);
        fs::create_dir_all(&path)?;

        for (file, value) in self.limits.controller_values() {
            if let Err(e) = fs::write(path.join(file), &value) {
                warn!(group, file, error = %e, "Failed to set cgroup limit");
            }
        }

        fs::write(path.join("cgroup.procs"), pid.to_string())?;
        debug!(group, pid, "Applied worker resource limits");
        Ok(path)
    }

    /// Remove a worker's group once its processes are gone
    pub fn cleanup(&self, group: &str) {
        let path = self.group_path(group);
        if let Err(e) = fs::remove_dir(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(group, error = %e, "Failed to remove worker cgroup");
            }
        }
    }
}

/// Enable the cpu, memory and pids controllers for children of `group`
fn delegate_controllers(group: &Path) -> bool {
    let control = group.join("cgroup.subtree_control");
    match fs::write(&control, "+cpu +memory +pids") {
        Ok(()) => true,
        Err(e) => {
            warn!(
                path = %control.display(),
                error = %e,
                "Could not delegate cgroup controllers, worker limits may not apply"
            );
            false
        }
    }
}
