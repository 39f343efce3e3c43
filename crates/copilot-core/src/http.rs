//! Mapping of HTTP outcomes onto [`AgentError`] for the upstream clients.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::error::AgentError;

const MAX_ERROR_BODY_CHARS: usize = 200;

/// Rate limits and server errors are transient; other client errors are not.
pub fn classify_status(
    service: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> AgentError {
    let snippet: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
    let message = if snippet.is_empty() {
        format!("{service} returned HTTP {}", status.as_u16())
    } else {
        format!("{service} returned HTTP {}: {snippet}", status.as_u16())
    };

    let error = AgentError::upstream(message);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        match retry_after {
            Some(delay) => error.with_retry_after(delay),
            None => error,
        }
    } else {
        error.permanent()
    }
}

pub fn classify_transport(service: &str, err: &reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::timeout(format!("{service} request timed out"))
    } else {
        AgentError::upstream(format!("{service} request failed: {err}"))
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
