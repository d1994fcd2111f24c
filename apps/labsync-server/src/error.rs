//! Error types for the Lab Sync server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;
use crate::sync::SyncError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

fn store_error_parts(e: &StoreError) -> (StatusCode, &'static str, String) {
    match e {
        StoreError::Unavailable(_) => {
            tracing::error!("Store unavailable: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "Sync store is unavailable".to_string(),
            )
        }
        _ => {
            tracing::error!("Store error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                "Store error".to_string(),
            )
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone())
            }
            AppError::Sync(e) => match e {
                SyncError::BatchTooLarge { .. } => {
                    (StatusCode::BAD_REQUEST, "batch_too_large", e.to_string())
                }
                SyncError::UnknownEntityType(_) => {
                    (StatusCode::BAD_REQUEST, "unknown_entity_type", e.to_string())
                }
                SyncError::Store(store) => store_error_parts(store),
            },
            AppError::Store(e) => store_error_parts(e),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
