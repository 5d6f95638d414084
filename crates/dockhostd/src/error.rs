//! Daemon error types

use dock_persist::StoreError;
use dock_ssh::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(String),

    #[error("command blocked: {command}: {reason}")]
    CommandBlocked { command: String, reason: String },

    #[error("command failed: {message}")]
    CommandFailed {
        message: String,
        output: String,
        error: String,
    },

    #[error("app {0} not found")]
    UnknownApp(String),

    #[error("host {0} not found")]
    UnknownHost(String),

    #[error("app {0} has no running container")]
    MissingContainer(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lifecycle(#[from] dock_lifecycle::LifecycleError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DaemonResult<T> = Result<T, DaemonError>;
