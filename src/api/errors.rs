//! API error types and JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use std::any::Any;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::auth::AuthError;

/// Errors returned to HTTP callers.
///
/// Authentication failures carry deliberately generic messages; internal
/// details are logged, never sent.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    BadRequest(String),

    #[error("No session token provided")]
    MissingToken,

    #[error("Invalid credentials")]
    InvalidCredentials { attempts_remaining: u32 },

    #[error("Invalid or expired session")]
    InvalidSession,

    #[error("IP mismatch")]
    IpMismatch,

    #[error("Too many failed attempts. Try again in {retry_after_minutes} minutes.")]
    TooManyAttempts { retry_after_minutes: u64 },

    /// `hint` is only populated outside production
    #[error("Server misconfiguration")]
    Misconfigured { hint: Option<String> },

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    /// Stable error code for clients
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::MissingToken => "MISSING_TOKEN",
            ApiError::InvalidCredentials { .. } => "INVALID_CREDENTIALS",
            ApiError::InvalidSession => "INVALID_SESSION",
            ApiError::IpMismatch => "IP_MISMATCH",
            ApiError::TooManyAttempts { .. } => "TOO_MANY_ATTEMPTS",
            ApiError::Misconfigured { .. } => "SERVER_MISCONFIGURED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingToken => StatusCode::UNAUTHORIZED,
            ApiError::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
            ApiError::InvalidSession => StatusCode::UNAUTHORIZED,
            ApiError::IpMismatch => StatusCode::UNAUTHORIZED,
            ApiError::TooManyAttempts { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Misconfigured { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a service error, keeping misconfiguration hints only when
    /// `expose_hints` is set.
    pub fn from_auth(err: AuthError, expose_hints: bool) -> Self {
        match err {
            AuthError::MissingFields => ApiError::BadRequest(err.to_string()),
            AuthError::MissingToken => ApiError::MissingToken,
            AuthError::InvalidCredentials {
                attempts_remaining,
                ..
            } => ApiError::InvalidCredentials { attempts_remaining },
            AuthError::LockedOut { .. } => ApiError::TooManyAttempts {
                retry_after_minutes: err.retry_after_minutes().unwrap_or(1),
            },
            AuthError::InvalidSession => ApiError::InvalidSession,
            AuthError::IpMismatch => ApiError::IpMismatch,
            AuthError::Misconfigured(hint) => {
                error!(hint = %hint, "login refused: server misconfiguration");
                ApiError::Misconfigured {
                    hint: expose_hints.then_some(hint),
                }
            }
            AuthError::Internal(detail) => ApiError::Internal(detail),
        }
    }

    fn to_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("success".into(), json!(false));
        body.insert("error".into(), json!(self.to_string()));
        body.insert("code".into(), json!(self.code()));

        match self {
            ApiError::InvalidCredentials { attempts_remaining } => {
                body.insert("attemptsRemaining".into(), json!(attempts_remaining));
            }
            ApiError::TooManyAttempts {
                retry_after_minutes,
            } => {
                body.insert("retryAfterMinutes".into(), json!(retry_after_minutes));
            }
            ApiError::Misconfigured { hint: Some(hint) } => {
                body.insert("hint".into(), json!(hint));
            }
            ApiError::Internal(detail) => {
                let request_id = Uuid::new_v4().to_string();
                let timestamp = chrono::Utc::now().to_rfc3339();
                error!(request_id = %request_id, detail = %detail, "internal error");
                body.insert("timestamp".into(), json!(timestamp));
                body.insert("requestId".into(), json!(request_id));
            }
            _ => {}
        }

        Value::Object(body)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_json())).into_response()
    }
}

/// Response for a handler that panicked; wired into `CatchPanicLayer`.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    ApiError::Internal(format!("handler panicked: {detail}")).into_response()
}

impl From<AuthError> for ApiError {
    /// Production-safe mapping: misconfiguration hints are dropped.
    fn from(err: AuthError) -> Self {
        ApiError::from_auth(err, false)
    }
}
