use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::OrderStatus;
use crate::services::commerce::coupon_service::CouponRejection;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Bad Request",
    "message": "Coupon has expired",
    "code": "coupon_expired",
    "request_id": "req-abc123xyz",
    "timestamp": "2026-01-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    #[schema(example = "Bad Request")]
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable error code
    #[schema(example = "coupon_expired")]
    pub code: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid shipping method: {0}")]
    InvalidShippingMethod(String),

    #[error("Item unavailable: {0}")]
    Unavailable(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("{}", .0.message)]
    Coupon(CouponRejection),

    #[error("Already enrolled: {0}")]
    AlreadyEnrolled(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Payment signature verification failed")]
    InvalidSignature,

    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    #[error("Payment not completed: {0}")]
    PaymentNotCompleted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot move order from {from} to {to}")]
    InvalidStatusTransition { from: OrderStatus, to: OrderStatus },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidShippingMethod(_) | Self::Coupon(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidSignature => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) | Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::AlreadyEnrolled(_) | Self::InvalidStatusTransition { .. } => {
                StatusCode::CONFLICT
            }
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::UnknownOrder(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PaymentNotCompleted(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Storage(_) | Self::DatabaseError(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable code placed in the error body.
    pub fn code(&self) -> String {
        match self {
            Self::Validation(_) => "validation_error".into(),
            Self::InvalidShippingMethod(_) => "invalid_shipping_method".into(),
            Self::Unavailable(_) => "item_unavailable".into(),
            Self::InsufficientStock(_) => "insufficient_stock".into(),
            Self::Coupon(rejection) => format!("coupon_{}", rejection.reason),
            Self::AlreadyEnrolled(_) => "already_enrolled".into(),
            Self::Gateway(_) => "gateway_error".into(),
            Self::InvalidSignature => "invalid_signature".into(),
            Self::UnknownOrder(_) => "unknown_order".into(),
            Self::PaymentNotCompleted(_) => "payment_not_completed".into(),
            Self::Storage(_) => "storage_error".into(),
            Self::DatabaseError(_) => "database_error".into(),
            Self::Unauthorized(_) => "unauthorized".into(),
            Self::Forbidden(_) => "forbidden".into(),
            Self::NotFound(_) => "not_found".into(),
            Self::InvalidStatusTransition { .. } => "invalid_status_transition".into(),
            Self::Internal(_) => "internal_error".into(),
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::Storage(_) | Self::Internal(_) => "Internal server error".to_string(),
            Self::Gateway(_) => {
                "Payment provider is unavailable, please try again".to_string()
            }
            Self::InvalidSignature => "Payment verification failed".to_string(),
            // Coupon rejections are surfaced verbatim to the shopper
            Self::Coupon(rejection) => rejection.message.clone(),
            _ => self.to_string(),
        }
    }

    /// Retryable failures the caller may repeat without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Gateway(_) | Self::Storage(_) | Self::DatabaseError(_)
        )
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            code: self.code(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::commerce::coupon_service::RejectionReason;
    use axum::body::to_bytes;
    use rstest::rstest;

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::NotFound("missing".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, "not_found");
    }

    #[tokio::test]
    async fn coupon_rejection_is_surfaced_verbatim_with_reason_code() {
        let err = ServiceError::Coupon(CouponRejection::new(
            RejectionReason::BelowMinimum,
            "Minimum cart value of 500.00 required",
        ));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.code, "coupon_below_minimum");
        assert_eq!(payload.message, "Minimum cart value of 500.00 required");
    }

    #[rstest]
    #[case(ServiceError::Validation("x".into()), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::InvalidShippingMethod("x".into()), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::Unavailable("x".into()), StatusCode::UNPROCESSABLE_ENTITY)]
    #[case(ServiceError::InsufficientStock("x".into()), StatusCode::UNPROCESSABLE_ENTITY)]
    #[case(ServiceError::AlreadyEnrolled("x".into()), StatusCode::CONFLICT)]
    #[case(ServiceError::Gateway("x".into()), StatusCode::BAD_GATEWAY)]
    #[case(ServiceError::InvalidSignature, StatusCode::BAD_REQUEST)]
    #[case(ServiceError::UnknownOrder("x".into()), StatusCode::NOT_FOUND)]
    #[case(ServiceError::PaymentNotCompleted("x".into()), StatusCode::PAYMENT_REQUIRED)]
    #[case(ServiceError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    #[case(ServiceError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED)]
    #[case(ServiceError::Forbidden("x".into()), StatusCode::FORBIDDEN)]
    fn service_error_status_code_mapping(#[case] err: ServiceError, #[case] status: StatusCode) {
        assert_eq!(err.status_code(), status);
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::Storage("insert into orders failed: disk full".into())
                .response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("secret dsn".into())).response_message(),
            "Database error"
        );
        assert!(!ServiceError::Gateway("401 from https://gw/internal".into())
            .response_message()
            .contains("gw/internal"));

        assert_eq!(
            ServiceError::NotFound("Order not found".into()).response_message(),
            "Not found: Order not found"
        );
    }

    #[test]
    fn only_infrastructure_failures_are_retryable() {
        assert!(ServiceError::Gateway("timeout".into()).is_retryable());
        assert!(ServiceError::Storage("x".into()).is_retryable());
        assert!(!ServiceError::InvalidSignature.is_retryable());
        assert!(!ServiceError::UnknownOrder("x".into()).is_retryable());
    }
}
