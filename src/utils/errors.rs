// src/utils/errors.rs
//! Error types shared across the runner

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runner errors
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Missing or invalid configuration, including the host's own role annotation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Non-retryable failure reported by the cluster API
    #[error("Cluster query failed: {0}")]
    ClusterQuery(String),

    /// Retryable cluster failure (transport, throttling, server errors, broken watch)
    #[error("Transient cluster error: {0}")]
    TransientCluster(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Write rejected because the resource changed since it was read
    #[error("Resource conflict: {0}")]
    Conflict(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Bot '{bot}' failed to start: {reason}")]
    BotStartup { bot: String, reason: String },

    /// A bot handler exited unsuccessfully
    #[error("Bot handler failed: {0}")]
    Handler(String),

    #[error("Sandbox network violation: {0}")]
    SandboxNetworkViolation(String),

    #[error("Sandbox capability denied: {0}")]
    SandboxCapabilityDenied(String),

    #[error("Sandbox filesystem error: {0}")]
    SandboxFilesystem(String),

    #[error("Name resolution failed: {0}")]
    NameResolution(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    /// Typed error response received from another endpoint
    #[error("Endpoint {sender} rejected request ({kind}): {message}")]
    IpcRemote {
        sender: String,
        kind: String,
        message: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RunnerError::TransientCluster(_) | RunnerError::Timeout(_) | RunnerError::Io(_)
        )
    }

    pub fn bot_startup(bot: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RunnerError::BotStartup {
            bot: bot.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<kube::Error> for RunnerError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => {
                RunnerError::NotFound(response.message.clone())
            }
            kube::Error::Api(response) if response.code == 409 => {
                RunnerError::Conflict(response.message.clone())
            }
            kube::Error::Api(response) if response.code == 429 || response.code >= 500 => {
                RunnerError::TransientCluster(err.to_string())
            }
            kube::Error::Api(_) => RunnerError::ClusterQuery(err.to_string()),
            _ => RunnerError::TransientCluster(err.to_string()),
        }
    }
}

impl From<kube::runtime::watcher::Error> for RunnerError {
    fn from(err: kube::runtime::watcher::Error) -> Self {
        RunnerError::TransientCluster(format!("watch failed: {}", err))
    }
}

impl From<config::ConfigError> for RunnerError {
    fn from(err: config::ConfigError) -> Self {
        RunnerError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RunnerError::TransientCluster("reset".into()).is_transient());
        assert!(RunnerError::Timeout("poll".into()).is_transient());
        assert!(!RunnerError::ClusterQuery("forbidden".into()).is_transient());
        assert!(!RunnerError::InvariantViolation("client".into()).is_transient());
        assert!(!RunnerError::Conflict("botrunners/a".into()).is_transient());
    }

    #[test]
    fn test_bot_startup_message() {
        let err = RunnerError::bot_startup("greeter", "fetch failed");
        assert_eq!(err.to_string(), "Bot 'greeter' failed to start: fetch failed");
    }
}
