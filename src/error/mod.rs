use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Startup and HTTP-surface errors.
///
/// Socket-side failures never reach this type; they are reported to the
/// sender as `{status:"error"}` frames instead.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Price client error: {0}")]
    PriceClient(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::PriceClient(_) => "PRICE_CLIENT_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message shown to HTTP clients; details are masked in production
    fn public_message(&self) -> String {
        if !is_production() {
            return self.to_string();
        }
        match self {
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::PriceClient(_) | AppError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        tracing::error!(
            code = self.code(),
            status = status.as_u16(),
            error = %self,
            "HTTP request failed"
        );

        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_response() {
        let response = AppError::Internal("encoder broke".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_codes() {
        assert_eq!(AppError::Internal("x".into()).code(), "INTERNAL_ERROR");
    }
}
