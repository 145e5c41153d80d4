//! Error types for switchyard.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// Result type alias for switchyard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for switchyard.
///
/// Every variant maps to exactly one HTTP status and one client-visible
/// error `type` in the OpenAI error body shape.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid or missing API key")]
    InvalidAuth,

    #[error("Rate limit exceeded ({scope})")]
    RateLimited {
        scope: &'static str,
        retry_after_secs: u64,
    },

    #[error("Model '{model}' not found")]
    ModelNotFound { model: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Upstream rejected the request: {0}")]
    UpstreamBadRequest(String),

    #[error("All upstream providers failed: {message}")]
    UpstreamUnavailable { message: String },

    #[error("{0} is not supported on this endpoint")]
    Unsupported(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault error: {0}")]
    Vault(#[from] crate::vault::VaultError),
}

impl Error {
    /// HTTP status code for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidAuth => StatusCode::UNAUTHORIZED,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamBadRequest(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Error::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Vault(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-visible error `type` in the OpenAI error body.
    pub fn client_type(&self) -> &'static str {
        match self {
            Error::InvalidAuth
            | Error::ModelNotFound { .. }
            | Error::BadRequest(_)
            | Error::UpstreamBadRequest(_)
            | Error::Unsupported(_) => "invalid_request_error",
            Error::RateLimited { .. } => "rate_limit_exceeded",
            _ => "api_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details never reach the client body.
        let message = match &self {
            Error::Config(_) | Error::Internal(_) | Error::Database(_) | Error::Vault(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        // Return OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": message,
                "type": self.client_type(),
                "code": status.as_u16()
            }
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let Error::RateLimited {
            retry_after_secs, ..
        } = &self
        {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                header::HeaderValue::from(*retry_after_secs),
            );
        }
        response
    }
}
