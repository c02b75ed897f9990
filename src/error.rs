use thiserror::Error;

/// Errors raised while launching, watching, or tearing down a sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The container runtime could not be reached
    #[error("container runtime unreachable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to create sandbox: {0}")]
    CreateFailed(String),

    #[error("failed to start sandbox {id}: {reason}")]
    StartFailed { id: String, reason: String },

    #[error("failed to attach to sandbox {id}: {reason}")]
    AttachFailed { id: String, reason: String },

    #[error("failed to remove sandbox {id}: {reason}")]
    RemoveFailed { id: String, reason: String },

    /// Forced removal did not complete within the grace period
    #[error("removing sandbox {id} timed out after {seconds}s")]
    RemoveTimedOut { id: String, seconds: u64 },

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Errors raised while resolving configuration from the environment.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;
