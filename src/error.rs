use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::payments::GatewayError;

/// User-facing message constants, shared by handlers and tests.
pub mod msg {
    pub const COURSE_NOT_FOUND: &str = "Course not found";
    pub const ORDER_NOT_FOUND: &str = "Order not found";
    pub const NO_PAYMENT_FOR_COURSE: &str = "No payment found for this course";
    pub const COURSE_NOT_FREE: &str = "Course is not free - start a checkout instead";
    pub const COURSE_IS_FREE: &str = "Course is free - enroll via /enrollments";
    pub const ALREADY_ENROLLED: &str = "Already enrolled in this course";
    pub const INVALID_GATEWAY: &str = "Invalid gateway. Use 'stripe', 'mercadopago', 'hotmart' or 'kiwify'";
    pub const GATEWAY_NOT_CONFIGURED: &str = "Payment gateway is not available";
    pub const EXTERNAL_CHECKOUT_NOT_AVAILABLE: &str = "External checkout is not available for this course";
    pub const TAX_ID_REQUIRED: &str = "A CPF must be saved before continuing to the external checkout";
    pub const INVALID_CPF: &str = "Invalid CPF";
    pub const CHECKOUT_RETRYABLE: &str = "Payment provider is temporarily unavailable, please try again";
    pub const CHECKOUT_IN_PROGRESS: &str = "A checkout for this course is already in progress, retry shortly";
    pub const CHECKOUT_DECLINED: &str = "Payment provider declined the checkout";
    pub const NOT_REDIRECT_ORDER: &str = "Only external-checkout orders can be confirmed manually";
    pub const ORDER_ALREADY_FINAL: &str = "Order is already in a final state";
    pub const INVALID_SIGNATURE_FORMAT: &str = "Invalid signature format";
    pub const INVALID_TIMESTAMP_IN_SIGNATURE: &str = "Invalid timestamp in signature";
    pub const INVALID_WEBHOOK_SECRET: &str = "Invalid webhook secret";
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Gateway failures surfacing to the checkout caller. Provider detail stays in the logs.
impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(detail) => {
                tracing::warn!("Gateway unavailable: {}", detail);
                AppError::ServiceUnavailable(msg::CHECKOUT_RETRYABLE.into())
            }
            GatewayError::Rejected(detail) => {
                tracing::warn!("Gateway rejected request: {}", detail);
                AppError::BadGateway(msg::CHECKOUT_DECLINED.into())
            }
            GatewayError::Misconfigured(detail) => {
                tracing::error!("Gateway misconfigured: {}", detail);
                AppError::BadRequest(msg::GATEWAY_NOT_CONFIGURED.into())
            }
            GatewayError::SignatureInvalid(_) => AppError::Unauthorized,
            GatewayError::Unsupported(op) => {
                AppError::Internal(format!("Unsupported gateway operation: {}", op))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "Not found", Some(msg.clone())),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Bad request", Some(msg.clone())),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized", None),
            AppError::PaymentRequired(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "Payment required", Some(msg.clone()))
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "Conflict", Some(msg.clone())),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "Bad gateway", Some(msg.clone())),
            AppError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                Some(msg.clone()),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid JSON", Some(e.to_string()))
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Converts `Option<T>` lookups into `AppError::NotFound`.
pub trait OptionExt<T> {
    fn or_not_found(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_not_found(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| AppError::NotFound(msg.to_string()))
    }
}
