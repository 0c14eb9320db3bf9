//! Error types shared by every Raffel component.
//!
//! Failures anywhere in the runtime are expressed as an [`RpcError`]: a
//! closed [`ErrorKind`] plus a human-readable message and optional JSON
//! details. The kind determines the numeric status every adapter uses on the
//! wire, so an error raised deep inside an interceptor renders the same over
//! HTTP, TCP or JSON-RPC.
//!
//! # Example
//!
//! ```
//! use raffel_core::{ErrorKind, RpcError};
//!
//! let err = RpcError::new(ErrorKind::NotFound, "no such procedure");
//! assert_eq!(err.status(), 404);
//! assert!(!err.is_retryable());
//! ```

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of error kinds understood by every adapter.
///
/// Wire codes are the `SCREAMING_SNAKE_CASE` names; numeric statuses come
/// from [`ErrorKind::status`]. Codes not in this set deserialize to
/// [`ErrorKind::InternalError`].
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorKind {
    /// The target procedure or resource does not exist.
    NotFound,
    /// The request was malformed.
    InvalidArgument,
    /// Input failed the registered validator.
    ValidationError,
    /// No usable credentials were presented.
    Unauthenticated,
    /// Credentials were presented but do not grant access.
    PermissionDenied,
    /// The entity already exists (duplicate registration, conflict).
    AlreadyExists,
    /// A precondition for the operation does not hold.
    FailedPrecondition,
    /// The request was understood but cannot be processed.
    UnprocessableEntity,
    /// The caller exceeded its quota.
    RateLimited,
    /// A resource pool is exhausted.
    ResourceExhausted,
    /// The deadline passed before the handler finished.
    DeadlineExceeded,
    /// The request was cancelled by the caller or the transport.
    Cancelled,
    /// The procedure exists but is not implemented.
    Unimplemented,
    /// The server cannot currently serve the request.
    Unavailable,
    /// An upstream dependency returned garbage.
    BadGateway,
    /// An upstream dependency timed out.
    GatewayTimeout,
    /// Unrecoverable data corruption or loss.
    DataLoss,
    /// Any unexpected failure.
    InternalError,
    /// Bytes on the wire could not be parsed.
    ParseError,
    /// Parsed bytes do not form a minimal envelope.
    InvalidEnvelope,
}

impl ErrorKind {
    /// Canonical numeric status, used verbatim by the HTTP adapters.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::InvalidArgument | Self::ValidationError | Self::ParseError | Self::InvalidEnvelope => 400,
            Self::Unauthenticated => 401,
            Self::PermissionDenied => 403,
            Self::AlreadyExists => 409,
            Self::FailedPrecondition => 412,
            Self::UnprocessableEntity => 422,
            Self::RateLimited | Self::ResourceExhausted => 429,
            Self::DeadlineExceeded | Self::GatewayTimeout => 504,
            Self::Cancelled => 499,
            Self::Unimplemented => 501,
            Self::Unavailable => 503,
            Self::BadGateway => 502,
            Self::DataLoss | Self::InternalError => 500,
        }
    }

    /// Whether a client may retry the failed call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable
                | Self::ResourceExhausted
                | Self::DeadlineExceeded
                | Self::RateLimited
                | Self::InternalError
                | Self::BadGateway
                | Self::GatewayTimeout
        )
    }

    /// Fixed JSON-RPC 2.0 numeric code for this kind.
    ///
    /// The reserved codes keep their conventional meaning; everything else
    /// lands in the implementation-defined `-32000..=-32099` band.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidEnvelope => -32600,
            Self::NotFound | Self::Unimplemented => -32601,
            Self::InvalidArgument | Self::ValidationError => -32602,
            Self::InternalError => -32603,
            Self::Unauthenticated => -32000,
            Self::PermissionDenied => -32001,
            Self::AlreadyExists => -32002,
            Self::FailedPrecondition => -32003,
            Self::UnprocessableEntity => -32004,
            Self::RateLimited => -32005,
            Self::ResourceExhausted => -32006,
            Self::DeadlineExceeded => -32007,
            Self::Cancelled => -32008,
            Self::Unavailable => -32009,
            Self::BadGateway => -32010,
            Self::GatewayTimeout => -32011,
            Self::DataLoss => -32012,
        }
    }

    /// Wire code string, e.g. `NOT_FOUND`.
    #[must_use]
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::UnprocessableEntity => "UNPROCESSABLE_ENTITY",
            Self::RateLimited => "RATE_LIMITED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::BadGateway => "BAD_GATEWAY",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
            Self::DataLoss => "DATA_LOSS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidEnvelope => "INVALID_ENVELOPE",
        }
    }

    /// Parse a wire code string; unknown codes map to `InternalError`.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "NOT_FOUND" => Self::NotFound,
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "VALIDATION_ERROR" => Self::ValidationError,
            "UNAUTHENTICATED" => Self::Unauthenticated,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "ALREADY_EXISTS" => Self::AlreadyExists,
            "FAILED_PRECONDITION" => Self::FailedPrecondition,
            "UNPROCESSABLE_ENTITY" => Self::UnprocessableEntity,
            "RATE_LIMITED" => Self::RateLimited,
            "RESOURCE_EXHAUSTED" => Self::ResourceExhausted,
            "DEADLINE_EXCEEDED" => Self::DeadlineExceeded,
            "CANCELLED" => Self::Cancelled,
            "UNIMPLEMENTED" => Self::Unimplemented,
            "UNAVAILABLE" => Self::Unavailable,
            "BAD_GATEWAY" => Self::BadGateway,
            "GATEWAY_TIMEOUT" => Self::GatewayTimeout,
            "DATA_LOSS" => Self::DataLoss,
            "PARSE_ERROR" => Self::ParseError,
            "INVALID_ENVELOPE" => Self::InvalidEnvelope,
            _ => Self::InternalError,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// The error type carried through the router, interceptors and adapters.
#[derive(thiserror::Error, Clone, Debug)]
#[error("{kind}: {message}")]
pub struct RpcError {
    /// Which member of the closed taxonomy this is.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional structured details (rate-limit state, validation paths, ...).
    pub details: Option<Value>,
}

impl RpcError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// `NOT_FOUND` for an unknown procedure.
    pub fn not_found(procedure: impl AsRef<str>) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("procedure `{}` is not registered", procedure.as_ref()),
        )
    }

    /// `VALIDATION_ERROR` with the validator's message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    /// `INVALID_ARGUMENT`.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// `CANCELLED`, with the conventional message when no reason is given.
    pub fn cancelled(reason: Option<&str>) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            reason.unwrap_or("request cancelled"),
        )
    }

    /// `DEADLINE_EXCEEDED` raised by a local timeout.
    ///
    /// Locally-originated deadline failures surface HTTP 408 instead of the
    /// kind's 504, and record the elapsed time in the details.
    pub fn deadline_exceeded_local(elapsed_ms: u64) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, "deadline exceeded").with_details(serde_json::json!({
            "local": true,
            "elapsed_ms": elapsed_ms,
        }))
    }

    /// `INTERNAL_ERROR` wrapping an unexpected failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Numeric status for HTTP-shaped adapters.
    ///
    /// Identical to [`ErrorKind::status`] except that locally-originated
    /// `DEADLINE_EXCEEDED` reports 408.
    #[must_use]
    pub fn status(&self) -> u16 {
        if self.kind == ErrorKind::DeadlineExceeded && self.is_local_deadline() {
            return 408;
        }
        self.kind.status()
    }

    /// Whether a client may retry the failed call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    fn is_local_deadline(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.get("local"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `{code, message, details?}` object adapters put on the wire.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut body = serde_json::json!({
            "code": self.kind.as_code(),
            "message": self.message,
        });
        if let Some(details) = &self.details {
            body["details"] = details.clone();
        }
        body
    }

    /// Parse the wire object produced by [`RpcError::to_wire`].
    #[must_use]
    pub fn from_wire(value: &Value) -> Self {
        let kind = value
            .get("code")
            .and_then(Value::as_str)
            .map(ErrorKind::from_code)
            .unwrap_or(ErrorKind::InternalError);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_owned();
        Self {
            kind,
            message,
            details: value.get("details").cloned(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::ParseError, e.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::InternalError, e.to_string())
    }
}
