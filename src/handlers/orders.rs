use crate::{
    auth::{AdminUser, AuthUser},
    handlers::common::success,
    services::commerce::order_service::{EnrollmentView, OrderView, UpdateOrderStatusRequest},
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::{Path, State},
    routing::{get, patch},
    Json, Router,
};
use uuid::Uuid;

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/enrollments", get(list_enrollments))
}

pub fn admin_order_routes() -> Router<AppState> {
    Router::new().route("/:id/status", patch(update_order_status))
}

/// The caller's orders with the prices they were charged, newest first
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List my orders",
    responses(
        (status = 200, description = "Orders retrieved successfully", body = ApiResponse<Vec<OrderView>>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<OrderView>> {
    Ok(success(
        state.services.orders.list_orders(&user.user_id).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get my order",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order retrieved successfully", body = ApiResponse<OrderView>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<OrderView> {
    Ok(success(
        state.services.orders.get_order(&user.user_id, id).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/enrollments",
    summary = "List my enrollments",
    responses(
        (status = 200, description = "Enrollments retrieved successfully", body = ApiResponse<Vec<EnrollmentView>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_enrollments(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<EnrollmentView>> {
    Ok(success(
        state.services.orders.list_enrollments(&user.user_id).await?,
    ))
}

/// Fulfilment moves only: pending to cancelled, paid to shipped to delivered
#[utoipa::path(
    patch,
    path = "/api/v1/admin/orders/{id}/status",
    summary = "Update order status",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderView>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Transition not allowed", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> ApiResult<OrderView> {
    Ok(success(
        state
            .services
            .orders
            .update_status(id, payload.status)
            .await?,
    ))
}
