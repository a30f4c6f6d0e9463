use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("dependency conflict: {0}")]
    Dependency(String),
    #[error("invalid signature")]
    Security,
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },
    #[error("unreconciled payment notification: {0}")]
    Unreconciled(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Dependency(_) => StatusCode::CONFLICT,
            // Signature failure details are never echoed back to the caller.
            AppError::Security => StatusCode::BAD_REQUEST,
            AppError::Transient(_) | AppError::Provider { .. } => StatusCode::BAD_GATEWAY,
            AppError::Unreconciled(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
