use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type for configuration, planning and setup failures.
#[derive(Debug, Error)]
pub enum CopilotError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("planning error: {0}")]
    Planning(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CopilotError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Classification used by the orchestrator to decide retry vs. fail vs. degrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// Caller-supplied data is malformed. Never retried.
    InvalidInput,
    /// An external service failed. Retried with backoff unless permanent.
    UpstreamError,
    /// A deadline elapsed before the call returned.
    Timeout,
}

impl AgentErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentErrorKind::InvalidInput => "invalid_input",
            AgentErrorKind::UpstreamError => "upstream_error",
            AgentErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure returned across the agent boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub permanent: bool,
}

impl AgentError {
    pub fn new(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
            permanent: false,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::InvalidInput, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::UpstreamError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Timeout, message)
    }

    /// Attach the provider's retry-after hint.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Mark an upstream failure as not worth retrying (auth, bad request, ...).
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == AgentErrorKind::UpstreamError && !self.permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_upstream_errors_are_retryable() {
        assert!(AgentError::upstream("503").is_retryable());
        assert!(!AgentError::upstream("401").permanent().is_retryable());
        assert!(!AgentError::invalid_input("empty table").is_retryable());
        assert!(!AgentError::timeout("deadline").is_retryable());
    }

    #[test]
    fn display_includes_kind() {
        let err = AgentError::upstream("rate limited").with_retry_after(Duration::from_secs(3));
        assert_eq!(err.to_string(), "upstream_error: rate limited");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }
}
