use crate::middleware::error_handling;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No key in the envelope ring opens the payload.
    #[error("no envelope key could decrypt the payload")]
    DecryptionExhausted,

    #[error("store unavailable: {0}")]
    TransientStore(String),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::TransientStore(format!("postgres: {e}"))
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::TransientStore(format!("postgres pool: {e}"))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::TransientStore(format!("redis: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(format!("serialization: {e}"))
    }
}

// NOTE: actix-web provides `impl<T: ResponseError> From<T> for actix_web::Error`,
// so handlers can return `AppResult` directly.

impl AppError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::TransientStore(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::DecryptionExhausted => 422,
            AppError::TransientStore(_) => 503,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code, shared by HTTP bodies and websocket error frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "VALIDATION_ERROR",
            AppError::Unauthorized => "AUTH_ERROR",
            AppError::Forbidden(_) => "AUTHORIZATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::DecryptionExhausted => "DECRYPTION_EXHAUSTED",
            AppError::TransientStore(_) => "STORE_UNAVAILABLE",
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Message safe to hand to clients; internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::TransientStore(_) => "temporarily unavailable, retry".to_string(),
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(AppError::TransientStore("timeout".into()).is_retryable());
        assert!(!AppError::Forbidden("not a participant".into()).is_retryable());
        assert!(!AppError::DecryptionExhausted.is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::Unauthorized.status_code(), 401);
        assert_eq!(AppError::Forbidden(String::new()).status_code(), 403);
        assert_eq!(AppError::BadRequest(String::new()).status_code(), 400);
        assert_eq!(AppError::NotFound(String::new()).status_code(), 404);
        assert_eq!(AppError::DecryptionExhausted.status_code(), 422);
        assert_eq!(AppError::TransientStore(String::new()).status_code(), 503);
    }

    #[test]
    fn test_public_message_hides_store_details() {
        let err = AppError::TransientStore("redis: connection refused 10.0.0.3".into());
        assert!(!err.public_message().contains("10.0.0.3"));
    }
}
