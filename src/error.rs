//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::ValidationError;
use crate::engine::EngineError;
use crate::query::QueryError;
use crate::store::StoreError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing required header: {0}")]
    MissingHeader(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Query(#[from] QueryError),

    // Server errors (5xx)
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    pub fn error_code(&self) -> &'static str {
        self.classify().1
    }

    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            AppError::MissingHeader(_) => (StatusCode::BAD_REQUEST, "missing_header"),
            AppError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::Validation(e) => classify_validation(e),
            AppError::Engine(e) => match e {
                EngineError::Validation(e) => classify_validation(e),
                EngineError::InsufficientFunds { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_funds")
                }
                EngineError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "account_not_found"),
                EngineError::Contention { .. } => (StatusCode::CONFLICT, "contention"),
                EngineError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "timeout"),
                EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            },
            AppError::Query(e) => match e {
                QueryError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "account_not_found"),
                QueryError::EntryNotFound(_) => (StatusCode::NOT_FOUND, "entry_not_found"),
                QueryError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            },
            AppError::Store(StoreError::AccountNotFound(_)) => {
                (StatusCode::NOT_FOUND, "account_not_found")
            }
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
        }
    }
}

fn classify_validation(e: &ValidationError) -> (StatusCode, &'static str) {
    match e {
        ValidationError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "invalid_amount"),
        ValidationError::Unauthorized { .. } => (StatusCode::FORBIDDEN, "unauthorized_operation"),
        ValidationError::MissingDestination(_) | ValidationError::UnexpectedDestination(_) => {
            (StatusCode::BAD_REQUEST, "invalid_destination")
        }
        ValidationError::SameAccount => (StatusCode::BAD_REQUEST, "same_account"),
        ValidationError::AccountNotActive { .. } => (StatusCode::CONFLICT, "account_not_active"),
        ValidationError::InvalidIdempotencyKey(_) => {
            (StatusCode::BAD_REQUEST, "invalid_idempotency_key")
        }
        ValidationError::IdempotencyKeyReused(_) => (StatusCode::CONFLICT, "idempotency_conflict"),
        ValidationError::DuplicateAccount(_) => (StatusCode::CONFLICT, "duplicate_account"),
        ValidationError::InvalidHandle(_) => (StatusCode::BAD_REQUEST, "invalid_handle"),
        ValidationError::InvalidStatusTransition { .. } => {
            (StatusCode::CONFLICT, "invalid_status_transition")
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.classify();

        // Internal details stay in the logs
        let (error, details) = if status.is_server_error() {
            tracing::error!(error = %self, error_code, "Request failed");
            ("Internal server error".to_string(), None)
        } else {
            let details = match &self {
                AppError::Engine(EngineError::InsufficientFunds {
                    required,
                    available,
                    ..
                }) => Some(format!("required {}, available {}", required, available)),
                AppError::Engine(EngineError::Contention { attempts }) => {
                    Some(format!("gave up after {} attempts, safe to retry", attempts))
                }
                _ => None,
            };
            (self.to_string(), details)
        };

        let body = ErrorResponse {
            error,
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}
