//! Error types for the deployment agent

use thiserror::Error;

/// Main error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Readiness error: {0}")]
    ReadinessError(String),

    #[error("Traffic switch error: {0}")]
    TrafficError(String),

    #[error("Deployment error: {0}")]
    DeployError(String),

    #[error("Notification error: {0}")]
    NotifyError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// True when the error is the task's cancellation signal surfacing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}
