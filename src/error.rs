//! Error handling for the affiliate service
//!
//! Centralized error management system providing consistent error types,
//! HTTP status code mapping, and automatic error logging for the entire
//! service. Domain-level ledger failures are defined in `ledger.rs` and
//! converted here for the HTTP boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use tracing::error;

use crate::ledger::LedgerError;

/// Comprehensive error type covering all service operations
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors
    Database(anyhow::Error),
    /// Authentication/authorization errors
    Auth(String),
    /// Validation errors
    Validation(String),
    /// Ledger state-machine and precondition errors
    Ledger(LedgerError),
    /// Not found errors
    NotFound(String),
    /// Internal server errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(err) => write!(f, "Database error: {}", err),
            AppError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::Ledger(err) => write!(f, "Ledger error: {}", err),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts application errors to proper HTTP responses with status codes
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, error_code) = match &self {
            AppError::Database(_) => {
                error!("Database error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "DATABASE_ERROR",
                )
            }
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone(), "AUTH_ERROR"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "VALIDATION_ERROR"),
            AppError::Ledger(err) => {
                let (status, code) = match err {
                    LedgerError::AffiliateNotFound(_) => (StatusCode::NOT_FOUND, "AFFILIATE_NOT_FOUND"),
                    LedgerError::AffiliateInactive(_) => (StatusCode::CONFLICT, "AFFILIATE_INACTIVE"),
                    LedgerError::InvalidTransactionType(_) => {
                        (StatusCode::BAD_REQUEST, "INVALID_TRANSACTION_TYPE")
                    }
                    LedgerError::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
                    LedgerError::StorageWriteFailed(_) => {
                        error!("Storage write failed: {}", err);
                        (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_WRITE_FAILED")
                    }
                };
                (status, err.to_string(), code)
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), "NOT_FOUND"),
            AppError::Internal(msg) => {
                error!("Internal error: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "INTERNAL_ERROR")
            }
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": error_code,
                "message": error_message
            },
            "timestamp": chrono::Utc::now()
        }));

        (status, body).into_response()
    }
}

/// Convenient result type for all application operations
pub type AppResult<T> = Result<T, AppError>;

/// Converts generic anyhow errors to application errors
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Database(err)
    }
}

/// Converts database errors to application errors
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(anyhow::Error::from(err))
    }
}

/// Converts JSON serialization errors to application errors
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("JSON parsing error: {}", err))
    }
}

/// Converts ledger domain errors to application errors
impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError::Ledger(err)
    }
}
