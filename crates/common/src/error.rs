use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// The caller is authenticated but does not own the resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid notification type: {0}")]
    InvalidType(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Backpressure signal from the dispatch orchestrator.
    #[error("Queue saturated: {0}")]
    QueueSaturated(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Redis(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InvalidType(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InvalidRecipient(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::QueueSaturated(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

/// Outcome of a failed channel send, as reported by a channel adapter.
///
/// Transient errors are retried with backoff; permanent errors are recorded
/// on the notification and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("transient channel error: {0}")]
    Transient(String),

    #[error("permanent channel error: {0}")]
    Permanent(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Transient(_))
    }

    /// The bare reason, without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            ChannelError::Transient(reason) | ChannelError::Permanent(reason) => reason,
        }
    }
}

impl From<AppError> for ChannelError {
    /// Missing or invalid rows are permanent; anything else is retried.
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) | AppError::Validation(msg) => ChannelError::Permanent(msg),
            other => ChannelError::Transient(other.to_string()),
        }
    }
}
