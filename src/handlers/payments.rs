use crate::{
    auth::AuthUser,
    handlers::common::success,
    services::commerce::reconciliation_service::{
        ReconcileRequest, ReconciliationResult, WebhookAck,
    },
    ApiResponse, ApiResult, AppState,
};
use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ConfirmSessionRequest {
    #[validate(length(min = 1, max = 255))]
    pub session_id: String,
}

pub fn payments_routes() -> Router<AppState> {
    Router::new()
        .route("/verify", post(verify_payment))
        .route("/sessions/confirm", post(confirm_session))
}

/// Webhooks authenticate by signature, not by bearer token.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook", post(payment_webhook))
}

/// Verifies the gateway's callback signature and settles the order or enrollment
#[utoipa::path(
    post,
    path = "/api/v1/payments/verify",
    summary = "Verify payment",
    request_body = ReconcileRequest,
    responses(
        (status = 200, description = "Record settled, already settled, or flagged for refund", body = ApiResponse<ReconciliationResult>),
        (status = 400, description = "Signature mismatch", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown gateway order", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(payload): Json<ReconcileRequest>,
) -> ApiResult<ReconciliationResult> {
    let result = state.services.reconciliation.reconcile(payload).await?;
    if result.refund_required {
        return Ok(Json(ApiResponse::success_with_message(
            result,
            "Payment received for a closed order; a refund is required",
        )));
    }
    if result.already_settled {
        return Ok(Json(ApiResponse::success_with_message(
            result,
            "Payment was already settled",
        )));
    }
    Ok(success(result))
}

/// Confirms a redirect checkout session by asking the gateway for its status
#[utoipa::path(
    post,
    path = "/api/v1/payments/sessions/confirm",
    summary = "Confirm checkout session",
    request_body = ConfirmSessionRequest,
    responses(
        (status = 200, description = "Enrollment completed", body = ApiResponse<ReconciliationResult>),
        (status = 402, description = "Session not paid", body = crate::errors::ErrorResponse),
        (status = 403, description = "Session belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown session", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn confirm_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ConfirmSessionRequest>,
) -> ApiResult<ReconciliationResult> {
    payload.validate()?;
    let result = state
        .services
        .reconciliation
        .confirm_session(&user.user_id, &payload.session_id)
        .await?;
    Ok(success(result))
}

/// Signed gateway webhook. The raw body is needed for signature verification.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    summary = "Payment webhook",
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Event accepted", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Signature mismatch or malformed payload", body = crate::errors::ErrorResponse),
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    let ack = state
        .services
        .reconciliation
        .handle_webhook(&headers, &body)
        .await?;
    Ok(success(ack))
}
