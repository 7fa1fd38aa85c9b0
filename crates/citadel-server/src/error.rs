//! HTTP error mapping.
//!
//! Translates the core's error taxonomy onto the wire: 400 malformed, 403
//! authentication/authorization, 404 not found, 409 conflict, 307
//! redirect-to-leader, 429 rate limiting, 500 internal (with a transient
//! marker for retryable upstream failures), 503 sealed / no active node.
//!
//! Integrity-fatal errors terminate the process with exit code 2 after
//! logging — a node that has detected barrier corruption or apply
//! divergence must not keep serving.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use citadel_core::error::CoreError;

/// An HTTP-mapped failure.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    error: &'static str,
    message: String,
    /// Redirect target for 307 responses.
    location: Option<String>,
    /// Marks errors clients may safely retry.
    retryable: bool,
}

/// JSON error body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "is_false")]
    retryable: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

impl AppError {
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            message: message.into(),
            location: None,
            retryable: false,
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal_error",
            message: message.into(),
            location: None,
            retryable: false,
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Sealed => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: "sealed",
                message: err.to_string(),
                location: None,
                retryable: false,
            },
            CoreError::Standby { ref leader_addr } => Self {
                status: StatusCode::TEMPORARY_REDIRECT,
                error: "standby",
                message: err.to_string(),
                location: leader_addr.clone(),
                retryable: true,
            },
            CoreError::NoLeader => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: "no_active_node",
                message: err.to_string(),
                location: None,
                retryable: true,
            },
            CoreError::Unauthorized | CoreError::PermissionDenied => Self {
                status: StatusCode::FORBIDDEN,
                error: "permission_denied",
                message: "permission denied".to_owned(),
                location: None,
                retryable: false,
            },
            CoreError::InvalidRequest { .. } => Self {
                status: StatusCode::BAD_REQUEST,
                error: "invalid_request",
                message: err.to_string(),
                location: None,
                retryable: false,
            },
            CoreError::NotFound { .. } => Self {
                status: StatusCode::NOT_FOUND,
                error: "not_found",
                message: err.to_string(),
                location: None,
                retryable: false,
            },
            CoreError::Conflict { .. } => Self {
                status: StatusCode::CONFLICT,
                error: "conflict",
                message: err.to_string(),
                location: None,
                retryable: false,
            },
            CoreError::Timeout => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: "timeout",
                message: err.to_string(),
                location: None,
                retryable: true,
            },
            CoreError::Upstream { .. } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: "upstream",
                message: err.to_string(),
                location: None,
                retryable: true,
            },
            CoreError::Fatal { ref reason } => {
                tracing::error!(reason = %reason, "integrity failure; terminating");
                std::process::exit(2);
            }
            CoreError::Internal { .. } => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            message: self.message,
            retryable: self.retryable,
        };
        let mut response = (self.status, axum::Json(body)).into_response();
        if let Some(location) = self.location {
            if let Ok(value) = header::HeaderValue::from_str(&location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
        }
        response
    }
}
