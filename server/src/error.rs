//! HTTP error type for the reservation API.
//!
//! Bridges admission rejections and domain errors onto HTTP responses with a
//! `{code, message}` JSON body.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use reservation_core::RejectReason;
use reservation_runtime::{LifecycleError, PollError, ReserveError};
use serde::Serialize;
use std::fmt;

/// Seconds a `LOCK_BUSY` caller is asked to wait before retrying.
pub const LOCK_BUSY_RETRY_AFTER_SECS: u64 = 1;

/// Application error returned by handlers.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after: Option<u64>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Ask the client to retry after `seconds`.
    #[must_use]
    pub const fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Create a 503 Service Unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", message)
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code of this error.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl From<RejectReason> for AppError {
    fn from(reason: RejectReason) -> Self {
        let (status, message) = match reason {
            RejectReason::LockBusy => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many concurrent requests for this policy, retry shortly",
            ),
            RejectReason::Exhausted => (StatusCode::CONFLICT, "No units remain"),
            RejectReason::OutOfWindow => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "The policy is outside its validity window",
            ),
            RejectReason::PolicyNotFound => (StatusCode::NOT_FOUND, "Policy not found"),
            RejectReason::InvalidQuantity => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Quantity must be at least 1",
            ),
        };

        let error = Self::new(status, reason.code(), message);
        if reason.is_retryable() {
            error.with_retry_after(LOCK_BUSY_RETRY_AFTER_SECS)
        } else {
            error
        }
    }
}

impl From<ReserveError> for AppError {
    fn from(error: ReserveError) -> Self {
        match error {
            ReserveError::Interrupted(detail) => Self::internal(detail),
            other => Self::unavailable(other.to_string()),
        }
    }
}

impl From<LifecycleError> for AppError {
    fn from(error: LifecycleError) -> Self {
        let message = error.to_string();
        match error {
            LifecycleError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
            LifecycleError::NotOwner { .. } => Self::new(StatusCode::FORBIDDEN, "NOT_OWNER", message),
            LifecycleError::AlreadyUsed(_) => {
                Self::new(StatusCode::CONFLICT, "ALREADY_USED", message)
            }
            LifecycleError::NotUsed(_) => Self::new(StatusCode::CONFLICT, "NOT_USED", message),
            LifecycleError::NotAvailable { .. } => {
                Self::new(StatusCode::CONFLICT, "NOT_AVAILABLE", message)
            }
            LifecycleError::Expired(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "EXPIRED", message)
            }
            LifecycleError::PolicyNotFound(_) => Self::from(RejectReason::PolicyNotFound),
            LifecycleError::Ledger(_) | LifecycleError::Policy(_) | LifecycleError::Counter(_) => {
                Self::unavailable(message)
            }
        }
    }
}

impl From<PollError> for AppError {
    fn from(error: PollError) -> Self {
        Self::unavailable(error.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                code = %self.code,
                message = %self.message,
                "Request failed"
            );
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}
