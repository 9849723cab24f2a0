//! Error types for the data-access layer and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::validation::Violation;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by [`crate::db::Database`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Todo not found")]
    NotFound,

    /// Last-resort field guard tripped before the row was written.
    #[error("Validation error: {}", .0.join(", "))]
    Invalid(Vec<String>),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Error returned by request handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request validation failed")]
    Validation(Vec<Violation>),

    /// Body or query string could not be parsed at all.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<Vec<Violation>> for ApiError {
    fn from(violations: Vec<Violation>) -> Self {
        ApiError::Validation(violations)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(errors) => (StatusCode::BAD_REQUEST, json!({ "errors": errors })),
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            ApiError::Store(StoreError::NotFound) => (
                StatusCode::NOT_FOUND,
                json!({ "error": StoreError::NotFound.to_string() }),
            ),
            ApiError::Store(StoreError::Invalid(details)) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Validation error", "details": details }),
            ),
            err @ (ApiError::Store(_) | ApiError::Join(_)) => {
                tracing::error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": err.to_string() }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
