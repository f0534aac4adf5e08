//! HTTP error handling: the uniform `{error:{kind,message,retryable}}`
//! envelope.
//!
//! Non-retryable kinds map to 4xx statuses; transient kinds map to 5xx
//! and carry a `retry_after` hint when one is known.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// The wire error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Invalid request parameters.
    BadRequest(String),
    /// Resource not found.
    NotFound(String),
    /// The request deadline elapsed before a result was ready.
    DeadlineExceeded,
    /// Store failure, classified transient or not by the store itself.
    Store(StoreError),
    /// Unexpected internal failure.
    Internal(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, ApiError) {
        match self {
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    kind: "bad_request".to_string(),
                    message: message.clone(),
                    retryable: false,
                    retry_after: None,
                },
            ),
            AppError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    kind: "not_found".to_string(),
                    message: message.clone(),
                    retryable: false,
                    retry_after: None,
                },
            ),
            AppError::DeadlineExceeded => (
                StatusCode::REQUEST_TIMEOUT,
                ApiError {
                    kind: "deadline_exceeded".to_string(),
                    message: "request deadline exceeded".to_string(),
                    retryable: false,
                    retry_after: None,
                },
            ),
            AppError::Store(err) => {
                let retryable = err.is_retryable();
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ApiError {
                        kind: "store_error".to_string(),
                        message: err.to_string(),
                        retryable,
                        retry_after: retryable.then_some(1),
                    },
                )
            }
            AppError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError {
                    kind: "internal".to_string(),
                    message: message.clone(),
                    retryable: false,
                    retry_after: None,
                },
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = self.parts();
        (status, Json(ApiErrorEnvelope { error })).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { ref message, .. } => AppError::NotFound(message.clone()),
            other => AppError::Store(other),
        }
    }
}

impl From<crate::detect::DetectError> for AppError {
    fn from(err: crate::detect::DetectError) -> Self {
        match err {
            crate::detect::DetectError::Store(e) => e.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}
