use crate::{
    auth::AuthError,
    services::{object_store::ObjectStoreError, record_store::RecordStoreError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
///
/// `message` is what the client sees, so conversions from internal errors
/// log the detail and keep only a short cause here.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ObjectStoreError> for AppError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(_) => AppError::not_found("audio file not found"),
            other => {
                tracing::error!("object store error: {}", other);
                AppError::internal("storage error")
            }
        }
    }
}

impl From<RecordStoreError> for AppError {
    fn from(err: RecordStoreError) -> Self {
        match err {
            RecordStoreError::NotFound(_) => AppError::not_found("audio file not found"),
            other => {
                tracing::error!("record store error: {}", other);
                AppError::internal("database error")
            }
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        tracing::debug!("rejecting request: {}", err);
        AppError::unauthorized(err.to_string())
    }
}
