//! Coupon eligibility at checkout and single redemption at payment time.

mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{callback_sig, decimal, response_json, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::{json, Value};
use settlement_api::entities::{coupon_usage, CouponUsage, Order};
use uuid::Uuid;

fn address() -> Value {
    json!({ "line1": "4 Park Street", "city": "Kolkata", "country": "IN" })
}

async fn checkout(app: &TestApp, user: &str, product_id: Uuid, qty: i32, code: &str) -> Value {
    let response = app
        .post_as(
            user,
            "/api/v1/checkout/cart",
            json!({
                "items": [{ "product_id": product_id, "quantity": qty }],
                "shipping_method": "standard",
                "shipping_address": address(),
                "coupon_code": code,
            }),
        )
        .await;
    let status = response.status();
    let body = response_json(response).await;
    assert_eq!(status, StatusCode::CREATED, "checkout failed: {body}");
    body["data"].clone()
}

async fn pay(app: &TestApp, user: &str, handle: &Value, payment_id: &str) -> Value {
    let gateway_order_id = handle["gateway_order_id"].as_str().unwrap();
    let response = app
        .post_as(
            user,
            "/api/v1/payments/verify",
            json!({
                "kind": "cart",
                "gateway_order_id": gateway_order_id,
                "gateway_payment_id": payment_id,
                "signature": callback_sig(gateway_order_id, payment_id),
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    response_json(response).await["data"].clone()
}

async fn validate(app: &TestApp, code: &str, subtotal: &str) -> Value {
    let response = app
        .post_as(
            "user-1",
            "/api/v1/coupons/validate",
            json!({ "code": code, "cart_subtotal": subtotal }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    response_json(response).await["data"].clone()
}

#[tokio::test]
async fn percentage_discount_is_capped() {
    let app = TestApp::new().await;
    app.create_coupon(json!({
        "code": "save20",
        "discount_type": "percentage",
        "discount_value": "20",
        "max_discount": "100",
    }))
    .await;

    let preview = validate(&app, " Save20 ", "1000").await;
    assert_eq!(preview["valid"], true);
    assert_eq!(preview["code"], "SAVE20");
    assert_eq!(decimal(&preview["discount_amount"]), dec!(100));
}

#[tokio::test]
async fn minimum_cart_value_is_inclusive() {
    let app = TestApp::new().await;
    app.create_coupon(json!({
        "code": "MIN500",
        "discount_type": "fixed",
        "discount_value": "50",
        "min_cart_value": "500",
    }))
    .await;

    let below = validate(&app, "MIN500", "499.99").await;
    assert_eq!(below["valid"], false);
    assert_eq!(below["message"], "Minimum cart value of 500.00 required");
    assert_eq!(below["rejection"]["reason"], "below_minimum");

    let at = validate(&app, "MIN500", "500").await;
    assert_eq!(at["valid"], true);
    assert_eq!(decimal(&at["discount_amount"]), dec!(50));
}

#[tokio::test]
async fn unknown_and_future_coupons_are_rejected_with_reasons() {
    let app = TestApp::new().await;
    app.create_coupon(json!({
        "code": "LATER",
        "discount_type": "fixed",
        "discount_value": "10",
        "start_date": (Utc::now() + Duration::days(2)).to_rfc3339(),
    }))
    .await;

    let unknown = validate(&app, "NOPE", "100").await;
    assert_eq!(unknown["valid"], false);
    assert_eq!(unknown["message"], "Invalid coupon code");

    let later = validate(&app, "LATER", "100").await;
    assert_eq!(later["rejection"]["reason"], "not_yet_active");
}

#[tokio::test]
async fn rejected_coupon_blocks_checkout_without_calling_the_gateway() {
    let app = TestApp::new().await;
    let item = app.seed_product("Tray", dec!(200), 5).await;
    app.create_coupon(json!({
        "code": "OLD10",
        "discount_type": "percentage",
        "discount_value": "10",
        "start_date": (Utc::now() - Duration::days(10)).to_rfc3339(),
        "end_date": (Utc::now() - Duration::days(1)).to_rfc3339(),
    }))
    .await;

    let response = app
        .post_as(
            "user-1",
            "/api/v1/checkout/cart",
            json!({
                "items": [{ "product_id": item.id, "quantity": 1 }],
                "shipping_method": "standard",
                "shipping_address": address(),
                "coupon_code": "old10",
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["code"], "coupon_expired");
    assert_eq!(body["message"], "Coupon has expired");
    assert!(app.gateway.orders().is_empty());
}

#[tokio::test]
async fn discount_is_applied_after_shipping_is_decided() {
    let app = TestApp::new().await;
    let item = app.seed_product("Rug", dec!(520), 5).await;
    app.create_coupon(json!({
        "code": "FLAT100",
        "discount_type": "fixed",
        "discount_value": "100",
    }))
    .await;

    let handle = checkout(&app, "user-1", item.id, 1, "FLAT100").await;
    // Shipping is free on the 520 subtotal even though 420 is payable
    assert_eq!(decimal(&handle["breakdown"]["shipping"]), dec!(0));
    assert_eq!(decimal(&handle["breakdown"]["discount"]), dec!(100));
    assert_eq!(decimal(&handle["breakdown"]["payable"]), dec!(420));
    assert_eq!(handle["amount_minor"], 42000);
}

#[tokio::test]
async fn single_use_coupon_is_redeemed_once_across_orders() {
    let app = TestApp::new().await;
    let item = app.seed_product("Chair", dec!(700), 10).await;
    let coupon = app
        .create_coupon(json!({
            "code": "ONCE",
            "discount_type": "fixed",
            "discount_value": "100",
            "usage_limit": 1,
        }))
        .await;
    let coupon_id: Uuid = coupon["id"].as_str().unwrap().parse().unwrap();

    // Both checkouts pass because nothing has been redeemed yet
    let first = checkout(&app, "alice", item.id, 1, "ONCE").await;
    let second = checkout(&app, "bob", item.id, 1, "ONCE").await;

    assert_eq!(pay(&app, "alice", &first, "pay_a").await["status"], "paid");
    assert_eq!(pay(&app, "bob", &second, "pay_b").await["status"], "paid");

    let usages = CouponUsage::find()
        .filter(coupon_usage::Column::CouponId.eq(coupon_id))
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(usages, 1);

    let second_id: Uuid = second["record_id"].as_str().unwrap().parse().unwrap();
    let second_order = Order::find_by_id(second_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(second_order
        .notes
        .as_deref()
        .unwrap_or_default()
        .contains("Coupon usage limit exceeded"));

    let admin = app.admin_token();
    let listed = response_json(
        app.request(Method::GET, "/api/v1/admin/coupons", None, Some(&admin))
            .await,
    )
    .await;
    assert_eq!(listed["data"][0]["times_used"], 1);

    // Exhausted now, so new checkouts are turned away
    let response = app
        .post_as(
            "carol",
            "/api/v1/checkout/cart",
            json!({
                "items": [{ "product_id": item.id, "quantity": 1 }],
                "shipping_method": "standard",
                "shipping_address": address(),
                "coupon_code": "ONCE",
            }),
        )
        .await;
    assert_eq!(response_json(response).await["code"], "coupon_limit_exceeded");
}

#[tokio::test]
async fn replayed_payment_does_not_record_a_second_usage() {
    let app = TestApp::new().await;
    let item = app.seed_product("Desk", dec!(900), 3).await;
    app.create_coupon(json!({
        "code": "DESK",
        "discount_type": "percentage",
        "discount_value": "10",
    }))
    .await;

    let handle = checkout(&app, "user-1", item.id, 1, "DESK").await;
    pay(&app, "user-1", &handle, "pay_1").await;
    let replay = pay(&app, "user-1", &handle, "pay_1").await;
    assert_eq!(replay["already_settled"], true);

    let usages = CouponUsage::find().count(&*app.state.db).await.unwrap();
    assert_eq!(usages, 1);
}

#[tokio::test]
async fn per_user_limit_applies_after_payment() {
    let app = TestApp::new().await;
    let item = app.seed_product("Lamp", dec!(300), 10).await;
    app.create_coupon(json!({
        "code": "WELCOME",
        "discount_type": "fixed",
        "discount_value": "30",
        "usage_limit_per_user": 1,
    }))
    .await;

    let handle = checkout(&app, "user-1", item.id, 1, "WELCOME").await;
    pay(&app, "user-1", &handle, "pay_1").await;

    let again = app
        .post_as(
            "user-1",
            "/api/v1/checkout/cart",
            json!({
                "items": [{ "product_id": item.id, "quantity": 1 }],
                "shipping_method": "standard",
                "shipping_address": address(),
                "coupon_code": "WELCOME",
            }),
        )
        .await;
    let body = response_json(again).await;
    assert_eq!(body["code"], "coupon_already_used");
    assert_eq!(body["message"], "You have already used this coupon");

    // Someone else can still use it
    checkout(&app, "user-2", item.id, 1, "WELCOME").await;
}

#[tokio::test]
async fn coupon_administration_requires_admin_role() {
    let app = TestApp::new().await;
    let user = app.token_for("user-1");

    let response = app
        .request(
            Method::POST,
            "/api/v1/admin/coupons",
            Some(json!({ "code": "HACK", "discount_type": "fixed", "discount_value": "500" })),
            Some(&user),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_can_update_and_deactivate_coupons() {
    let app = TestApp::new().await;
    let admin = app.admin_token();
    let coupon = app
        .create_coupon(json!({
            "code": "SPRING",
            "discount_type": "fixed",
            "discount_value": "25",
        }))
        .await;
    let id = coupon["id"].as_str().unwrap();

    let duplicate = app
        .request(
            Method::POST,
            "/api/v1/admin/coupons",
            Some(json!({ "code": "spring", "discount_type": "fixed", "discount_value": "5" })),
            Some(&admin),
        )
        .await;
    assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);

    let too_generous = app
        .request(
            Method::PUT,
            &format!("/api/v1/admin/coupons/{}", id),
            Some(json!({ "code": "SPRING", "discount_type": "percentage", "discount_value": "150" })),
            Some(&admin),
        )
        .await;
    assert_eq!(too_generous.status(), StatusCode::BAD_REQUEST);

    let updated = app
        .request(
            Method::PUT,
            &format!("/api/v1/admin/coupons/{}", id),
            Some(json!({ "code": "SPRING", "discount_type": "percentage", "discount_value": "15" })),
            Some(&admin),
        )
        .await;
    assert_eq!(updated.status(), StatusCode::OK);
    assert_eq!(
        decimal(&validate(&app, "SPRING", "200").await["discount_amount"]),
        dec!(30)
    );

    let deactivated = app
        .request(
            Method::POST,
            &format!("/api/v1/admin/coupons/{}/deactivate", id),
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(deactivated.status(), StatusCode::OK);
    assert_eq!(response_json(deactivated).await["data"]["is_active"], false);
    assert_eq!(validate(&app, "SPRING", "200").await["valid"], false);
}

#[tokio::test]
async fn concurrent_payments_redeem_a_per_user_coupon_once() {
    let app = TestApp::new().await;
    let item = app.seed_product("Stool", dec!(450), 10).await;
    app.create_coupon(json!({
        "code": "FIRSTBUY",
        "discount_type": "percentage",
        "discount_value": "10",
        "usage_limit_per_user": 1,
    }))
    .await;

    // Two tabs check out before either pays
    let first = checkout(&app, "user-1", item.id, 1, "FIRSTBUY").await;
    let second = checkout(&app, "user-1", item.id, 1, "FIRSTBUY").await;

    let (a, b) = tokio::join!(
        pay(&app, "user-1", &first, "pay_a"),
        pay(&app, "user-1", &second, "pay_b"),
    );
    assert_eq!(a["status"], "paid");
    assert_eq!(b["status"], "paid");

    let usages = CouponUsage::find()
        .filter(coupon_usage::Column::UserId.eq("user-1"))
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(usages, 1);
}
