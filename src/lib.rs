//! Settlement API Library
//!
//! Catalog pricing, coupon eligibility, order assembly and payment
//! reconciliation for a storefront that sells physical goods and courses.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod middleware_helpers;
pub mod openapi;
pub mod payments;
pub mod services;
pub mod tracing;

use axum::{response::Json, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::auth::AuthConfig;
use crate::logging::LoggingState;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub auth: Arc<AuthConfig>,
    pub services: handlers::AppServices,
    pub event_sender: Arc<events::EventSender>,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    /// Success envelope carrying a human-readable note, e.g. for idempotent replays.
    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success(data)
        }
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[test]
    fn message_is_kept_alongside_data() {
        let response = ApiResponse::success_with_message(7, "already settled");
        assert!(response.success);
        assert_eq!(response.data, Some(7));
        assert_eq!(response.message.as_deref(), Some("already settled"));
        assert!(response.meta.is_some());
    }

    #[test]
    fn meta_is_present_outside_a_request_scope() {
        let response = ApiResponse::success(());
        let meta = response.meta.expect("metadata expected");
        assert!(meta.request_id.is_none());
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Every versioned route, mounted under `/api/v1` by [`build_router`].
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .nest("/checkout", handlers::checkout::checkout_routes())
        .nest(
            "/payments",
            handlers::payments::payments_routes().merge(handlers::payments::webhook_routes()),
        )
        .nest("/coupons", handlers::coupons::coupon_routes())
        .merge(handlers::orders::order_routes())
        .nest("/admin/coupons", handlers::coupons::admin_coupon_routes())
        .nest("/admin/orders", handlers::orders::admin_order_routes())
}

/// Assembles the full HTTP surface: versioned API, health, metrics and docs,
/// wrapped in request-id, tracing and access-log layers.
pub fn build_router(state: AppState, logging_state: Arc<LoggingState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        .layer(axum::middleware::from_fn_with_state(
            logging_state,
            logging::logging_middleware,
        ))
        .layer(tracing::configure_http_tracing())
        // Outermost so every inner layer and handler sees the request id
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}
