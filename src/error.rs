use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::billing::BillingError;

/// HTTP-facing error for the billing service
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message safe to return to clients.
    ///
    /// Server-side variants carry only the message chosen at conversion time;
    /// `Anyhow` is always masked.
    fn safe_message(&self) -> String {
        match self {
            Self::Anyhow(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        tracing::error!(
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
        });
        (status, body).into_response()
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        let message = err.to_string();
        match &err {
            e if e.is_not_found() => AppError::NotFound(message),
            e if e.is_validation() => AppError::Unprocessable(message),
            BillingError::GatewayState { .. } => AppError::Conflict(message),
            BillingError::InvalidWebhook { .. } => AppError::BadRequest(message),
            BillingError::Gateway { .. } if err.is_retryable() => {
                AppError::ServiceUnavailable("Payment provider temporarily unavailable".to_string())
            }
            BillingError::Gateway { .. } => {
                AppError::BadGateway("Payment provider request failed".to_string())
            }
            BillingError::CurrencyMismatch { .. } | BillingError::Configuration { .. } => {
                AppError::Internal(message)
            }
            _ => AppError::Internal("Internal server error".to_string()),
        }
    }
}

/// Result type alias for HTTP handlers
pub type Result<T> = std::result::Result<T, AppError>;
