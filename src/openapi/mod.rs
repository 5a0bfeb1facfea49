use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Settlement API",
        version = "1.0.0",
        description = r#"
# Storefront Settlement API

Turns carts and course selections into paid orders and enrollments.

## Flow

1. `POST /checkout/cart` or `POST /checkout/course` prices the request from the
   catalog, applies an optional coupon and opens a gateway payment order.
2. The client completes payment with the gateway.
3. `POST /payments/verify` (or the signed `/payments/webhook`) verifies the
   gateway signature and settles the pending record exactly once.

## Authentication

Endpoints other than the webhook require a bearer token from the identity provider:

```
Authorization: Bearer <your-jwt-token>
```

## Error Handling

Errors share one body format; `code` is machine readable:

```json
{
  "error": "Bad Request",
  "message": "Coupon has expired",
  "code": "coupon_expired",
  "request_id": "req-abc123",
  "timestamp": "2026-01-01T00:00:00Z"
}
```
        "#,
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Settlement creation and price previews"),
        (name = "Payments", description = "Payment verification and gateway webhooks"),
        (name = "Coupons", description = "Coupon previews"),
        (name = "Orders", description = "Order and enrollment history"),
        (name = "Admin", description = "Coupon administration and fulfilment")
    ),
    paths(
        // Checkout
        crate::handlers::checkout::checkout_cart,
        crate::handlers::checkout::checkout_course,
        crate::handlers::checkout::create_course_session,
        crate::handlers::checkout::quote_cart,

        // Payments
        crate::handlers::payments::verify_payment,
        crate::handlers::payments::confirm_session,
        crate::handlers::payments::payment_webhook,

        // Coupons
        crate::handlers::coupons::validate_coupon,
        crate::handlers::coupons::list_coupons,
        crate::handlers::coupons::create_coupon,
        crate::handlers::coupons::update_coupon,
        crate::handlers::coupons::deactivate_coupon,

        // Orders
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::list_enrollments,
        crate::handlers::orders::update_order_status,
    ),
    components(
        schemas(
            crate::ApiResponse<serde_json::Value>,
            crate::errors::ErrorResponse,
            crate::entities::OrderStatus,
            crate::entities::EnrollmentStatus,
            crate::entities::DiscountType,
            crate::events::SettlementKind,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDocV1::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_settlement_paths() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Settlement API"));
        assert!(json.contains("/api/v1/checkout/cart"));
        assert!(json.contains("/api/v1/payments/webhook"));
        assert!(json.contains("Bearer"));
    }
}
