use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub const CSRF_ERROR_CODE: &str = "EBADCSRFTOKEN";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION_FAILED: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("BAD_REQUEST: {0}")]
    BadRequest(String),
    #[error("UNAUTHORIZED: {0}")]
    Unauthorized(String),
    #[error("FORBIDDEN: {0}")]
    Forbidden(String),
    #[error("CSRF_REJECTED")]
    CsrfRejected,
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("RATE_LIMITED: retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::CsrfRejected => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Marks a 500 response whose body carries internal detail, so the
/// production masking layer can replace it.
#[derive(Debug, Clone, Copy)]
pub struct InternalErrorDetail;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Validation(details) => json!({"error": "Validation failed", "details": details}),
            Self::BadRequest(message)
            | Self::Unauthorized(message)
            | Self::Forbidden(message)
            | Self::NotFound(message) => json!({"error": message}),
            Self::CsrfRejected => json!({"error": "Invalid CSRF token", "code": CSRF_ERROR_CODE}),
            Self::RateLimited { .. } => json!({"error": "Too many requests, please try again later"}),
            Self::Io(message) | Self::Internal(message) => json!({"error": message}),
        };

        let mut response = (status, Json(body)).into_response();
        match &self {
            Self::RateLimited { retry_after_secs } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert("retry-after", value);
                }
            }
            Self::Io(message) | Self::Internal(message) => {
                tracing::error!(error = %message, "request failed with internal error");
                response.extensions_mut().insert(InternalErrorDetail);
            }
            _ => {}
        }
        response
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(value: bcrypt::BcryptError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
