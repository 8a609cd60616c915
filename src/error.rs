//! Closed, enumerated error types for the orchestration runtime (§7).
//!
//! Each subsystem gets its own error enum rather than a single catch-all, so
//! that callers can match on the taxonomy a layer actually produces.

use thiserror::Error;

/// Transport-layer errors from the message bus (§4.1, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no worker registered for role {0:?}")]
    UnknownTarget(String),
    #[error("request {0} timed out")]
    Timeout(String),
    #[error("bus was reset while request was pending")]
    BusShutdown,
    #[error("pending request queue overflowed, dropped oldest entry")]
    QueueOverflow,
}

/// Error taxonomy for the LLM client wrapper (§4.2, §7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    #[error("request timed out")]
    Timeout,
    #[error("transient upstream error")]
    Transient,
    #[error("permanent error, will not retry")]
    Permanent,
    #[error("unrecognized error")]
    Unknown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Domain-level errors raised by the workers and orchestrator (§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("maximum plan depth (3) reached")]
    MaxDepthReached,
    #[error("step {0} has already been sub-planned the maximum number of times")]
    MaxSubplanAttempts(String),
    #[error("maximum fix attempts reached for step {0}")]
    MaxFixAttempts(String),
    #[error("no session recorded for agent {0}")]
    NoSession(String),
    #[error("failed to parse response: {0}")]
    ParseFailure(String),
    #[error("orchestrator run() called before initialize()")]
    NotInitialized,
}

/// Categorizes a raw error string into the taxonomy in §4.2.
///
/// Deterministic: the same input string always yields the same kind (§8,
/// testable property 8).
pub fn categorize_error(message: &str) -> LlmErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        return LlmErrorKind::Timeout;
    }

    const TRANSIENT_MARKERS: &[&str] = &[
        "econnreset",
        "etimedout",
        "overloaded",
        "rate_limit",
        "503",
        "529",
    ];
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return LlmErrorKind::Transient;
    }

    const PERMANENT_MARKERS: &[&str] = &["invalid_api_key", "permission_denied", "invalid_request"];
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return LlmErrorKind::Permanent;
    }

    LlmErrorKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_timeout() {
        assert_eq!(categorize_error("request timed out"), LlmErrorKind::Timeout);
        assert_eq!(
            categorize_error("Timeout exceeded after 30s"),
            LlmErrorKind::Timeout
        );
    }

    #[test]
    fn categorizes_transient() {
        assert_eq!(
            categorize_error("upstream overloaded, please retry"),
            LlmErrorKind::Transient
        );
        assert_eq!(categorize_error("HTTP 503 Service Unavailable"), LlmErrorKind::Transient);
    }

    #[test]
    fn categorizes_permanent() {
        assert_eq!(
            categorize_error("invalid_api_key provided"),
            LlmErrorKind::Permanent
        );
    }

    #[test]
    fn falls_back_to_unknown() {
        assert_eq!(categorize_error("something weird happened"), LlmErrorKind::Unknown);
    }

    #[test]
    fn categorization_is_deterministic() {
        let msg = "connection reset: ECONNRESET";
        assert_eq!(categorize_error(msg), categorize_error(msg));
    }
}
