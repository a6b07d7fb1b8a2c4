// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Resource not found")]
    NotFound,

    #[error("A pending payment already exists for this booking")]
    PendingPaymentExists,

    #[error("M-Pesa authentication failed: {0}")]
    GatewayAuth(String),

    #[error("M-Pesa error: {0}")]
    Gateway(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string()),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required".to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Insufficient permissions".to_string()),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Resource not found".to_string()),
            AppError::PendingPaymentExists => (StatusCode::CONFLICT, "Duplicate pending payment".to_string()),
            AppError::GatewayAuth(_) => (StatusCode::BAD_GATEWAY, "M-Pesa authentication failed".to_string()),
            AppError::Gateway(_) => (StatusCode::BAD_GATEWAY, "M-Pesa error".to_string()),
            AppError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error".to_string()),
        };

        let body = Json(json!({
            "success": false,
            "error": error_message,
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<crate::services::mpesa::GatewayError> for AppError {
    fn from(err: crate::services::mpesa::GatewayError) -> Self {
        use crate::services::mpesa::GatewayError;
        match err {
            GatewayError::InvalidRequest(msg) => AppError::Validation(msg),
            GatewayError::Auth(msg) => AppError::GatewayAuth(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    // A missing row and a foreign-owned row must produce the same message,
    // otherwise the status endpoint leaks which transaction ids exist.
    #[test]
    fn not_found_is_generic() {
        let err = AppError::NotFound;
        assert_eq!(err.to_string(), "Resource not found");
    }

    #[test]
    fn gateway_error_maps_to_app_error() {
        use crate::services::mpesa::GatewayError;

        let err: AppError = GatewayError::InvalidRequest("Invalid amount".into()).into();
        assert!(matches!(err, AppError::Validation(_)));

        let err: AppError = GatewayError::Auth("bad credentials".into()).into();
        assert!(matches!(err, AppError::GatewayAuth(_)));
    }
}
