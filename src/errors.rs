use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application-specific error types.
///
/// The queue consumer relies on [`AppError::is_retryable`] to decide between
/// broker redelivery and terminal rejection, so every new variant must pick a
/// side explicitly.
#[derive(Debug)]
pub enum AppError {
    /// Input failed validation. Carries every violation, not just the first.
    Validation(Vec<String>),
    /// A lead with the same email already exists.
    Conflict {
        /// Id of the existing lead when the pre-check found it; `None` when
        /// the storage unique constraint fired first.
        existing_lead_id: Option<i64>,
    },
    /// Resource not found error.
    NotFound(String),
    /// Database-related errors.
    Database(sqlx::Error),
    /// Message broker publish/consume failure.
    Broker(String),
    /// Internal server error.
    Internal(String),
}

impl AppError {
    /// Whether a retry can plausibly fix this error.
    ///
    /// Bad input and duplicate emails are permanent; infrastructure failures
    /// are worth redelivering.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Validation(_) | AppError::Conflict { .. } | AppError::NotFound(_) => false,
            AppError::Database(_) | AppError::Broker(_) | AppError::Internal(_) => true,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(violations) => {
                write!(f, "Validation failed: {}", violations.join("; "))
            }
            AppError::Conflict { existing_lead_id } => match existing_lead_id {
                Some(id) => write!(f, "Lead with this email already exists (id {})", id),
                None => write!(f, "Lead with this email already exists"),
            },
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Database(e) => write!(f, "Database error: {}", e),
            AppError::Broker(msg) => write!(f, "Broker error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and a JSON
    /// body with `success: false`. Raw database and broker details are logged,
    /// never returned to the caller.
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Validation(violations) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "success": false,
                    "message": "Validation error",
                    "errors": violations,
                }),
            ),
            AppError::Conflict { existing_lead_id } => (
                StatusCode::CONFLICT,
                json!({
                    "success": false,
                    "message": "Lead with this email already exists",
                    "existing_lead_id": existing_lead_id,
                }),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({
                    "success": false,
                    "message": msg,
                }),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "success": false,
                        "message": "Internal server error",
                    }),
                )
            }
            AppError::Broker(msg) => {
                tracing::error!("Broker error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "success": false,
                        "message": "Internal server error",
                    }),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "success": false,
                        "message": "Internal server error",
                    }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    /// Converts a `sqlx::Error` into an `AppError`.
    ///
    /// A unique-constraint violation surfaces as the same `Conflict` kind the
    /// email pre-check produces, so callers see one contract either way.
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AppError::Conflict {
                existing_lead_id: None,
            },
            _ => AppError::Database(err),
        }
    }
}

impl From<async_nats::jetstream::context::PublishError> for AppError {
    fn from(err: async_nats::jetstream::context::PublishError) -> Self {
        AppError::Broker(err.to_string())
    }
}
