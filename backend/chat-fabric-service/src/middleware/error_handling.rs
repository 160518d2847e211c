use crate::error::AppError;
use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;

/// JSON body returned for every failed HTTP request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub code: String,
    pub retryable: bool,
}

pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        tracing::error!(error = %err, code = err.code(), "request failed");
    }

    let response = ErrorResponse {
        error: status
            .canonical_reason()
            .unwrap_or("Error")
            .to_string(),
        message: err.public_message(),
        status: status.as_u16(),
        code: err.code().to_string(),
        retryable: err.is_retryable(),
    };

    (status, response)
}

pub fn into_response(err: &AppError) -> HttpResponse {
    let (status, body) = map_error(err);
    HttpResponse::build(status).json(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_forbidden() {
        let (status, body) = map_error(&AppError::Forbidden("not a participant".into()));
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.code, "AUTHORIZATION_ERROR");
        assert_eq!(body.error, "Forbidden");
        assert!(!body.retryable);
    }

    #[test]
    fn test_map_transient_is_retryable() {
        let (status, body) = map_error(&AppError::TransientStore("pool timed out".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.retryable);
        assert!(!body.message.contains("pool"));
    }
}
