use crate::{
    auth::AuthUser,
    errors::ServiceError,
    handlers::common::{created, success},
    services::commerce::settlement_service::{
        CartSettlementRequest, CheckoutSessionHandle, Quote, QuoteRequest, SettlementHandle,
    },
    ApiResponse, ApiResult, AppState,
};
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CourseCheckoutRequest {
    pub course_id: Uuid,
}

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/cart", post(checkout_cart))
        .route("/course", post(checkout_course))
        .route("/course/session", post(create_course_session))
        .route("/quote", post(quote_cart))
}

/// Prices the cart, opens a gateway order and stores a pending order
#[utoipa::path(
    post,
    path = "/api/v1/checkout/cart",
    summary = "Checkout cart",
    request_body = CartSettlementRequest,
    responses(
        (status = 201, description = "Pending order created", body = ApiResponse<SettlementHandle>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Invalid cart, shipping method or coupon", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 422, description = "Item unavailable or out of stock", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn checkout_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CartSettlementRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SettlementHandle>>), ServiceError> {
    let handle = state
        .services
        .settlement
        .settle_cart(&user.user_id, payload)
        .await?;
    Ok(created(handle))
}

/// Opens a gateway order for a course, or enrolls directly when it is free
#[utoipa::path(
    post,
    path = "/api/v1/checkout/course",
    summary = "Checkout course",
    request_body = CourseCheckoutRequest,
    responses(
        (status = 201, description = "Pending or completed enrollment", body = ApiResponse<SettlementHandle>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 409, description = "Already enrolled", body = crate::errors::ErrorResponse),
        (status = 422, description = "Course unavailable", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn checkout_course(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CourseCheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SettlementHandle>>), ServiceError> {
    let handle = state
        .services
        .settlement
        .settle_course(&user.user_id, payload.course_id)
        .await?;
    Ok(created(handle))
}

/// Redirect checkout for a course through a hosted payment page
#[utoipa::path(
    post,
    path = "/api/v1/checkout/course/session",
    summary = "Create course checkout session",
    request_body = CourseCheckoutRequest,
    responses(
        (status = 201, description = "Checkout session created", body = ApiResponse<CheckoutSessionHandle>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 409, description = "Already enrolled", body = crate::errors::ErrorResponse),
        (status = 422, description = "Course unavailable", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn create_course_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CourseCheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutSessionHandle>>), ServiceError> {
    let handle = state
        .services
        .settlement
        .create_course_session(&user.user_id, payload.course_id)
        .await?;
    Ok(created(handle))
}

/// Price preview; nothing is stored and the gateway is not contacted
#[utoipa::path(
    post,
    path = "/api/v1/checkout/quote",
    summary = "Quote cart",
    request_body = QuoteRequest,
    responses(
        (status = 200, description = "Price breakdown", body = ApiResponse<Quote>),
        (status = 400, description = "Invalid cart, shipping method or coupon", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 422, description = "Item unavailable or out of stock", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn quote_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<QuoteRequest>,
) -> ApiResult<Quote> {
    let quote = state
        .services
        .settlement
        .quote(&user.user_id, payload)
        .await?;
    Ok(success(quote))
}
