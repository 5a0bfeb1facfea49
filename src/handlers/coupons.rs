use crate::{
    auth::{AdminUser, AuthUser},
    errors::ServiceError,
    handlers::common::{created, success},
    services::commerce::coupon_service::{
        CouponInput, CouponRejection, CouponView, EligibilityResult,
    },
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub cart_subtotal: Decimal,
}

/// Result of a speculative coupon check.
#[derive(Debug, Serialize, ToSchema)]
pub struct CouponPreview {
    pub valid: bool,
    pub message: String,
    pub coupon_id: Option<Uuid>,
    pub code: Option<String>,
    pub discount_amount: Option<Decimal>,
    pub rejection: Option<CouponRejection>,
}

impl From<EligibilityResult> for CouponPreview {
    fn from(result: EligibilityResult) -> Self {
        match result {
            EligibilityResult::Eligible { coupon, discount } => Self {
                valid: true,
                message: "Coupon applied successfully".into(),
                coupon_id: Some(coupon.id),
                code: Some(coupon.code),
                discount_amount: Some(discount),
                rejection: None,
            },
            EligibilityResult::Rejected(rejection) => Self {
                valid: false,
                message: rejection.message.clone(),
                coupon_id: None,
                code: None,
                discount_amount: None,
                rejection: Some(rejection),
            },
        }
    }
}

pub fn coupon_routes() -> Router<AppState> {
    Router::new().route("/validate", post(validate_coupon))
}

pub fn admin_coupon_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_coupons).post(create_coupon))
        .route("/:id", put(update_coupon))
        .route("/:id/deactivate", post(deactivate_coupon))
}

/// Checks a coupon against a cart subtotal without recording anything
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    summary = "Preview coupon",
    request_body = ValidateCouponRequest,
    responses(
        (status = 200, description = "Eligibility result", body = ApiResponse<CouponPreview>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Coupons"
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ValidateCouponRequest>,
) -> ApiResult<CouponPreview> {
    payload.validate()?;
    if payload.cart_subtotal < Decimal::ZERO {
        return Err(ServiceError::Validation(
            "cart_subtotal must not be negative".into(),
        ));
    }

    let result = state
        .services
        .coupons
        .evaluate(&payload.code, &user.user_id, payload.cart_subtotal)
        .await?;
    Ok(success(CouponPreview::from(result)))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/coupons",
    summary = "List coupons",
    responses(
        (status = 200, description = "All coupons, newest first", body = ApiResponse<Vec<CouponView>>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn list_coupons(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Vec<CouponView>> {
    Ok(success(state.services.coupons.list_coupons().await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/coupons",
    summary = "Create coupon",
    request_body = CouponInput,
    responses(
        (status = 201, description = "Coupon created", body = ApiResponse<CouponView>),
        (status = 400, description = "Invalid coupon or duplicate code", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn create_coupon(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(payload): Json<CouponInput>,
) -> Result<(StatusCode, Json<ApiResponse<CouponView>>), ServiceError> {
    let coupon = state.services.coupons.create_coupon(payload).await?;
    Ok(created(coupon))
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/coupons/{id}",
    summary = "Replace coupon",
    params(("id" = Uuid, Path, description = "Coupon id")),
    request_body = CouponInput,
    responses(
        (status = 200, description = "Coupon updated", body = ApiResponse<CouponView>),
        (status = 400, description = "Invalid coupon or duplicate code", body = crate::errors::ErrorResponse),
        (status = 404, description = "Coupon not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn update_coupon(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<CouponInput>,
) -> ApiResult<CouponView> {
    Ok(success(
        state.services.coupons.update_coupon(id, payload).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/coupons/{id}/deactivate",
    summary = "Deactivate coupon",
    params(("id" = Uuid, Path, description = "Coupon id")),
    responses(
        (status = 200, description = "Coupon deactivated", body = ApiResponse<CouponView>),
        (status = 404, description = "Coupon not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn deactivate_coupon(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<CouponView> {
    Ok(success(state.services.coupons.deactivate_coupon(id).await?))
}
