//! Error types for the deploy agent

use thiserror::Error;

/// Main error type for the deploy agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Corrupt status file: {0}")]
    CorruptState(String),

    #[error("Deployment error: {0}")]
    DeployError(String),

    #[error("Ping error: {0}")]
    PingError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Another agent is already running: {0}")]
    AlreadyRunning(String),
}
