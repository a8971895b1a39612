//! Unified error handling for the reconciler.
//!
//! Every fallible operation in this crate returns `Result<T, ReconcilerError>`.
//! The variants correspond to the error kinds named by the design: config
//! loading, transport (reaching a host), the container runtime itself, the
//! proxy's admin API, and the three CRUD-surfacing kinds used by the
//! Read/Query Surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// The kind of failure, independent of the message. Used by callers that
/// need to branch on error category (e.g. the event consumer's reconnect
/// backoff only applies to `Transport`/`Runtime`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Transport,
    Runtime,
    Proxy,
    Validation,
    Conflict,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Config => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Transport => StatusCode::BAD_GATEWAY,
            ErrorKind::Runtime => StatusCode::BAD_GATEWAY,
            ErrorKind::Proxy => StatusCode::BAD_GATEWAY,
            ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config_error",
            ErrorKind::Transport => "transport_error",
            ErrorKind::Runtime => "runtime_error",
            ErrorKind::Proxy => "proxy_error",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Conflict => "conflict_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

/// The unified error type. `ConfigError` at startup is fatal (the caller
/// matches on `kind()` and aborts); `TransportError`/`RuntimeError` inside an
/// event consumer trigger the reconnect backoff and never propagate further;
/// `ProxyError` during reconciliation is logged and retried on the next
/// sweep, but surfaces as a 5xx when it happens during operator-triggered
/// CRUD; `ValidationError`/`ConflictError`/`NotFoundError` always surface as
/// 4xx to the operator.
#[derive(Debug)]
pub struct ReconcilerError {
    kind: ErrorKind,
    message: String,
}

impl ReconcilerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn proxy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Proxy, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// True for the two kinds an event consumer should swallow and retry on,
    /// rather than propagate.
    pub fn is_retryable_in_consumer(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport | ErrorKind::Runtime)
    }
}

impl std::fmt::Display for ReconcilerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ReconcilerError {}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

impl IntoResponse for ReconcilerError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.kind.as_str().to_string(),
                message: self.message,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<serde_yaml::Error> for ReconcilerError {
    fn from(err: serde_yaml::Error) -> Self {
        ReconcilerError::config(format!("invalid YAML: {err}"))
    }
}

impl From<std::io::Error> for ReconcilerError {
    fn from(err: std::io::Error) -> Self {
        ReconcilerError::internal(format!("I/O error: {err}"))
    }
}

impl From<reqwest::Error> for ReconcilerError {
    fn from(err: reqwest::Error) -> Self {
        ReconcilerError::proxy(format!("proxy admin API request failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ReconcilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_propagation_policy() {
        assert_eq!(ErrorKind::Validation.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ErrorKind::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Proxy.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn transport_and_runtime_are_consumer_retryable() {
        assert!(ReconcilerError::transport("x").is_retryable_in_consumer());
        assert!(ReconcilerError::runtime("x").is_retryable_in_consumer());
        assert!(!ReconcilerError::proxy("x").is_retryable_in_consumer());
        assert!(!ReconcilerError::config("x").is_retryable_in_consumer());
    }

    #[test]
    fn display_includes_kind_tag() {
        let err = ReconcilerError::not_found("domain missing");
        assert_eq!(err.to_string(), "[not_found_error] domain missing");
    }
}
