//! Error types for the inference node.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy for the node's operations. Every public-facing failure
/// (HTTP handlers, engine calls, sync) maps onto one of these so the wire
/// error type is stable regardless of which component raised it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-range request parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Model, capability, or route not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request asks for something no registered engine can provide (e.g. an
    /// unsupported capability/architecture combination).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A dependency (engine process, router, filesystem) is temporarily down.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Admission was refused because of a concurrency or memory budget.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An operation took longer than its configured deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller disconnected or cancelled an in-flight request.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Anything else: bugs, unexpected I/O failures, protocol violations.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::Unsupported(_) => "unsupported",
            Error::Unavailable(_) => "unavailable",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unsupported(_) => StatusCode::BAD_REQUEST,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Cancelled(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => Error::Timeout(e.to_string()),
            _ => Error::Internal(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            // connection refused, DNS failure, or a malformed upstream response -
            // all of these mean "can't talk to the dependency right now"
            Error::Unavailable(e.to_string())
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

/// Body shape for the concurrency guard's rejection, distinct from the
/// `{error: {type, message}}` façade error shape since it's an admission-layer
/// concern rather than a façade error code.
pub fn too_many_requests_response() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "too_many_requests" }))).into_response()
}

/// Body for the readiness gate's rejection while the node is still syncing.
pub fn service_unavailable_response(message: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": { "type": "service_unavailable", "message": message } })),
    )
        .into_response()
}

pub type Result<T> = std::result::Result<T, Error>;
