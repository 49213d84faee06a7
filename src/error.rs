//! Failure classification.
//!
//! Every failure path in the crate ends up here: low-level errors are first
//! captured as a [`RawError`] (HTTP status, transport code, declared name)
//! and then turned into an [`AppError`] by walking a priority-ordered rule
//! table. The first matching rule wins.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Declared failure names understood by the classifier.
pub mod names {
    pub const CANCELLED: &str = "CancelledError";
    pub const ABORT: &str = "AbortError";
    pub const TIMEOUT: &str = "TimeoutError";
    pub const NETWORK: &str = "NetworkError";
    pub const VALIDATION: &str = "ValidationError";
    pub const MEMORY_EXCEEDED: &str = "MemoryExceededError";
    pub const WORKER: &str = "WorkerError";
    pub const PROCESSING: &str = "ProcessingError";
}

/// Transport codes understood by the classifier.
pub mod codes {
    pub const ABORTED: &str = "ECONNABORTED";
    pub const TIMED_OUT: &str = "ETIMEDOUT";
    pub const NETWORK: &str = "ERR_NETWORK";
    pub const REFUSED: &str = "ECONNREFUSED";
    pub const RESET: &str = "ECONNRESET";
    pub const NOT_FOUND: &str = "ENOTFOUND";
    pub const BROKEN_PIPE: &str = "EPIPE";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Upload,
    Processing,
    Download,
    Validation,
    Timeout,
    Server,
    Auth,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Upload => "upload",
            ErrorKind::Processing => "processing",
            ErrorKind::Download => "download",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server => "server",
            ErrorKind::Auth => "auth",
            ErrorKind::Unknown => "unknown",
        }
    }

    fn default_policy(&self) -> (Duration, u32) {
        match self {
            ErrorKind::Network | ErrorKind::Upload | ErrorKind::Download => {
                (Duration::from_secs(2), 3)
            }
            ErrorKind::Timeout => (Duration::from_secs(5), 2),
            ErrorKind::Server => (Duration::from_secs(5), 3),
            ErrorKind::Processing => (Duration::from_secs(1), 2),
            ErrorKind::Validation | ErrorKind::Auth | ErrorKind::Unknown => (Duration::ZERO, 0),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failure happened; used for 4xx responses that carry no more
/// specific meaning and recorded in [`ErrorDetails::context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorContext {
    Validation,
    Upload,
    Status,
    Download,
    Worker,
    Stream,
    Realtime,
}

impl ErrorContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorContext::Validation => "validation",
            ErrorContext::Upload => "upload",
            ErrorContext::Status => "status",
            ErrorContext::Download => "download",
            ErrorContext::Worker => "worker",
            ErrorContext::Stream => "stream",
            ErrorContext::Realtime => "realtime",
        }
    }

    fn client_error_kind(&self) -> ErrorKind {
        match self {
            ErrorContext::Upload => ErrorKind::Upload,
            ErrorContext::Download => ErrorKind::Download,
            ErrorContext::Validation => ErrorKind::Validation,
            ErrorContext::Worker | ErrorContext::Stream => ErrorKind::Processing,
            ErrorContext::Status | ErrorContext::Realtime => ErrorKind::Server,
        }
    }
}

/// A failure as it was observed, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RawError {
    pub name: Option<String>,
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn named(name: &str, message: impl Into<String>) -> Self {
        Self::new(message).with_name(name)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::named(names::CANCELLED, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::named(names::TIMEOUT, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::named(names::VALIDATION, message)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    fn name_is(&self, candidates: &[&str]) -> bool {
        self.name
            .as_deref()
            .is_some_and(|name| candidates.contains(&name))
    }

    fn code_is(&self, candidates: &[&str]) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| candidates.contains(&code))
    }

    fn status_in(&self, range: std::ops::RangeInclusive<u16>) -> bool {
        self.status.is_some_and(|status| range.contains(&status))
    }
}

impl From<std::io::Error> for RawError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let raw = RawError::new(err.to_string());
        match err.kind() {
            Io::TimedOut => raw.with_code(codes::TIMED_OUT),
            Io::ConnectionRefused => raw.with_code(codes::REFUSED),
            Io::ConnectionReset | Io::ConnectionAborted => raw.with_code(codes::RESET),
            Io::BrokenPipe => raw.with_code(codes::BROKEN_PIPE),
            Io::NotConnected | Io::AddrNotAvailable => raw.with_code(codes::NETWORK),
            _ => raw,
        }
    }
}

impl From<reqwest::Error> for RawError {
    fn from(err: reqwest::Error) -> Self {
        let mut raw = RawError::new(err.to_string());
        if let Some(status) = err.status() {
            raw = raw.with_status(status.as_u16());
        }
        if err.is_timeout() {
            raw.with_code(codes::ABORTED)
        } else if err.is_connect() || err.is_request() {
            raw.with_code(codes::NETWORK)
        } else if err.is_decode() || err.is_body() {
            raw.with_name(names::PROCESSING)
        } else {
            raw
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RawError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as Ws;
        match err {
            Ws::Http(response) => {
                RawError::new("websocket handshake rejected").with_status(response.status().as_u16())
            }
            Ws::Io(err) => err.into(),
            Ws::ConnectionClosed | Ws::AlreadyClosed => {
                RawError::new("websocket closed").with_code(codes::RESET)
            }
            other => RawError::new(other.to_string()).with_code(codes::NETWORK),
        }
    }
}

/// Markers for failures that callers need to tell apart from ordinary
/// errors of the same [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    MemoryExceeded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetails {
    pub cause: String,
    pub name: Option<String>,
    pub code: Option<String>,
    pub status: Option<u16>,
    pub context: Option<&'static str>,
}

/// The single classified failure representation. Built by [`classify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {user_message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub user_message: String,
    pub reason: Option<FailureReason>,
    pub details: ErrorDetails,
}

impl AppError {
    pub fn is_cancelled(&self) -> bool {
        self.reason == Some(FailureReason::Cancelled)
    }

    pub fn is_memory_exceeded(&self) -> bool {
        self.reason == Some(FailureReason::MemoryExceeded)
    }
}

struct Rule {
    matches: fn(&RawError) -> bool,
    /// `None` derives the kind from the [`ErrorContext`].
    kind: Option<ErrorKind>,
    retryable: bool,
    retry_delay: Option<Duration>,
    reason: Option<FailureReason>,
    message: &'static str,
}

fn is_cancelled(err: &RawError) -> bool {
    err.name_is(&[names::CANCELLED, names::ABORT])
}

fn is_memory_exceeded(err: &RawError) -> bool {
    err.name_is(&[names::MEMORY_EXCEEDED])
}

fn is_timeout(err: &RawError) -> bool {
    err.code_is(&[codes::ABORTED, codes::TIMED_OUT]) || err.name_is(&[names::TIMEOUT])
}

fn is_network(err: &RawError) -> bool {
    err.code_is(&[
        codes::NETWORK,
        codes::REFUSED,
        codes::RESET,
        codes::NOT_FOUND,
        codes::BROKEN_PIPE,
    ]) || err.name_is(&[names::NETWORK])
}

fn is_unauthorized(err: &RawError) -> bool {
    matches!(err.status, Some(401) | Some(403))
}

fn is_payload_too_large(err: &RawError) -> bool {
    err.status == Some(413)
}

fn is_unsupported_type(err: &RawError) -> bool {
    err.status == Some(415)
}

fn is_rate_limited(err: &RawError) -> bool {
    err.status == Some(429)
}

fn is_request_timeout(err: &RawError) -> bool {
    err.status == Some(408)
}

fn is_server_error(err: &RawError) -> bool {
    err.status.is_some_and(|status| status >= 500)
}

fn is_validation(err: &RawError) -> bool {
    err.name_is(&[names::VALIDATION])
}

fn is_worker_fault(err: &RawError) -> bool {
    err.name_is(&[names::WORKER])
}

fn is_processing(err: &RawError) -> bool {
    err.name_is(&[names::PROCESSING])
}

fn is_client_error(err: &RawError) -> bool {
    err.status_in(400..=499)
}

const RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

static RULES: &[Rule] = &[
    Rule {
        matches: is_cancelled,
        kind: Some(ErrorKind::Processing),
        retryable: true,
        retry_delay: Some(Duration::ZERO),
        reason: Some(FailureReason::Cancelled),
        message: "The operation was cancelled.",
    },
    Rule {
        matches: is_memory_exceeded,
        kind: Some(ErrorKind::Processing),
        retryable: false,
        retry_delay: None,
        reason: Some(FailureReason::MemoryExceeded),
        message: "The file is too large to process with the available memory.",
    },
    Rule {
        matches: is_timeout,
        kind: Some(ErrorKind::Timeout),
        retryable: true,
        retry_delay: None,
        reason: None,
        message: "The request timed out. Please try again.",
    },
    Rule {
        matches: is_network,
        kind: Some(ErrorKind::Network),
        retryable: true,
        retry_delay: None,
        reason: None,
        message: "Network connection failed. Check your connection and try again.",
    },
    Rule {
        matches: is_unauthorized,
        kind: Some(ErrorKind::Auth),
        retryable: false,
        retry_delay: None,
        reason: None,
        message: "You are not signed in or do not have access to this resource.",
    },
    Rule {
        matches: is_payload_too_large,
        kind: Some(ErrorKind::Validation),
        retryable: false,
        retry_delay: None,
        reason: None,
        message: "The file is too large.",
    },
    Rule {
        matches: is_unsupported_type,
        kind: Some(ErrorKind::Validation),
        retryable: false,
        retry_delay: None,
        reason: None,
        message: "This file type is not supported.",
    },
    Rule {
        matches: is_rate_limited,
        kind: Some(ErrorKind::Server),
        retryable: true,
        retry_delay: Some(RATE_LIMIT_DELAY),
        reason: None,
        message: "Too many requests. Please wait a moment before trying again.",
    },
    Rule {
        matches: is_request_timeout,
        kind: Some(ErrorKind::Timeout),
        retryable: true,
        retry_delay: None,
        reason: None,
        message: "The server took too long to respond. Please try again.",
    },
    Rule {
        matches: is_server_error,
        kind: Some(ErrorKind::Server),
        retryable: true,
        retry_delay: None,
        reason: None,
        message: "The server encountered an error. Please try again shortly.",
    },
    Rule {
        matches: is_validation,
        kind: Some(ErrorKind::Validation),
        retryable: false,
        retry_delay: None,
        reason: None,
        message: "The file could not be accepted.",
    },
    Rule {
        matches: is_worker_fault,
        kind: Some(ErrorKind::Processing),
        retryable: true,
        retry_delay: None,
        reason: None,
        message: "The background processor stopped unexpectedly.",
    },
    Rule {
        matches: is_processing,
        kind: Some(ErrorKind::Processing),
        retryable: false,
        retry_delay: None,
        reason: None,
        message: "The document could not be processed.",
    },
    Rule {
        matches: is_client_error,
        kind: None,
        retryable: false,
        retry_delay: None,
        reason: None,
        message: "The request was rejected.",
    },
];

/// Turns any raw failure into an [`AppError`].
pub fn classify(raw: &RawError, context: Option<ErrorContext>) -> AppError {
    let details = ErrorDetails {
        cause: raw.message.clone(),
        name: raw.name.clone(),
        code: raw.code.clone(),
        status: raw.status,
        context: context.map(|ctx| ctx.as_str()),
    };

    let error = match RULES.iter().find(|rule| (rule.matches)(raw)) {
        Some(rule) => {
            let kind = rule.kind.unwrap_or_else(|| {
                context
                    .map(|ctx| ctx.client_error_kind())
                    .unwrap_or(ErrorKind::Unknown)
            });
            let (default_delay, default_retries) = kind.default_policy();
            AppError {
                kind,
                retryable: rule.retryable,
                retry_delay: rule.retry_delay.unwrap_or(default_delay),
                max_retries: if rule.retryable { default_retries.max(1) } else { 0 },
                user_message: rule.message.to_string(),
                reason: rule.reason,
                details,
            }
        }
        None => AppError {
            kind: ErrorKind::Unknown,
            retryable: false,
            retry_delay: Duration::ZERO,
            max_retries: 0,
            user_message: "An unexpected error occurred.".to_string(),
            reason: None,
            details,
        },
    };

    debug!(
        kind = %error.kind,
        retryable = error.retryable,
        status = ?raw.status,
        code = ?raw.code,
        "classified failure: {}",
        raw.message
    );
    error
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_too_large_is_validation() {
        let err = classify(&RawError::new("too big").with_status(413), None);
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable);
        assert_eq!(err.max_retries, 0);
        assert_eq!(err.details.status, Some(413));
    }

    #[test]
    fn aborted_connection_is_timeout() {
        let err = classify(&RawError::new("aborted").with_code("ECONNABORTED"), None);
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.retryable);
    }

    #[test]
    fn status_code_policy() {
        let cases = [
            (500, ErrorKind::Server, true),
            (503, ErrorKind::Server, true),
            (415, ErrorKind::Validation, false),
            (401, ErrorKind::Auth, false),
            (403, ErrorKind::Auth, false),
            (429, ErrorKind::Server, true),
        ];
        for (status, kind, retryable) in cases {
            let err = classify(&RawError::new("http").with_status(status), None);
            assert_eq!(err.kind, kind, "status {status}");
            assert_eq!(err.retryable, retryable, "status {status}");
        }
    }

    #[test]
    fn rate_limit_waits_longer() {
        let limited = classify(&RawError::new("slow down").with_status(429), None);
        let server = classify(&RawError::new("oops").with_status(502), None);
        assert_eq!(limited.retry_delay, Duration::from_secs(60));
        assert!(limited.retry_delay > server.retry_delay);
    }

    #[test]
    fn first_matching_rule_wins() {
        // A cancelled request that also carries a 500 stays a cancellation.
        let raw = RawError::cancelled("user pressed stop").with_status(500);
        let err = classify(&raw, None);
        assert!(err.is_cancelled());
        assert_eq!(err.kind, ErrorKind::Processing);
    }

    #[test]
    fn plain_client_errors_follow_context() {
        let raw = RawError::new("missing").with_status(404);
        assert_eq!(
            classify(&raw, Some(ErrorContext::Download)).kind,
            ErrorKind::Download
        );
        assert_eq!(
            classify(&raw, Some(ErrorContext::Upload)).kind,
            ErrorKind::Upload
        );
        assert_eq!(classify(&raw, None).kind, ErrorKind::Unknown);
        assert!(!classify(&raw, Some(ErrorContext::Upload)).retryable);
    }

    #[test]
    fn unmatched_falls_back_to_unknown() {
        let err = classify(&RawError::new("???"), Some(ErrorContext::Worker));
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(!err.retryable);
        assert_eq!(err.details.context, Some("worker"));
        assert_eq!(err.details.cause, "???");
    }

    #[test]
    fn memory_exceeded_is_marked() {
        let err = classify(&RawError::named(names::MEMORY_EXCEEDED, "over"), None);
        assert!(err.is_memory_exceeded());
        assert!(!err.retryable);
    }

    #[test]
    fn io_errors_map_to_transport_codes() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify(&RawError::from(io), None);
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.retryable);

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(classify(&RawError::from(io), None).kind, ErrorKind::Timeout);
    }
}
