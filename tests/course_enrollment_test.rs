//! Course purchases: free enrollment, callback checkout and redirect sessions.

mod common;

use axum::http::StatusCode;
use common::{callback_sig, response_json, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::{json, Value};
use settlement_api::entities::{enrollment, Enrollment, EnrollmentStatus};
use uuid::Uuid;

async fn completed_enrollments(app: &TestApp, user: &str, course_id: Uuid) -> u64 {
    Enrollment::find()
        .filter(enrollment::Column::UserId.eq(user))
        .filter(enrollment::Column::CourseId.eq(course_id))
        .filter(enrollment::Column::PaymentStatus.eq(EnrollmentStatus::Completed))
        .count(&*app.state.db)
        .await
        .unwrap()
}

async fn start_session(app: &TestApp, user: &str, course_id: Uuid) -> Value {
    let response = app
        .post_as(
            user,
            "/api/v1/checkout/course/session",
            json!({ "course_id": course_id }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    response_json(response).await["data"].clone()
}

#[tokio::test]
async fn free_course_enrolls_without_the_gateway() {
    let app = TestApp::new().await;
    let course = app.seed_course("Intro to Clay", dec!(0), true).await;

    let response = app
        .post_as(
            "learner",
            "/api/v1/checkout/course",
            json!({ "course_id": course.id }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let handle = response_json(response).await["data"].clone();
    assert_eq!(handle["status"], "completed");
    assert_eq!(handle["amount_minor"], 0);
    assert!(handle["gateway_order_id"].is_null());
    assert!(app.gateway.orders().is_empty());

    let again = app
        .post_as(
            "learner",
            "/api/v1/checkout/course",
            json!({ "course_id": course.id }),
        )
        .await;
    assert_eq!(again.status(), StatusCode::CONFLICT);
    assert_eq!(response_json(again).await["code"], "already_enrolled");
    assert_eq!(completed_enrollments(&app, "learner", course.id).await, 1);
}

#[tokio::test]
async fn paid_course_completes_on_signed_callback() {
    let app = TestApp::new().await;
    let course = app.seed_course("Glazing", dec!(1499), false).await;

    let handle = response_json(
        app.post_as(
            "learner",
            "/api/v1/checkout/course",
            json!({ "course_id": course.id }),
        )
        .await,
    )
    .await["data"]
        .clone();
    assert_eq!(handle["kind"], "course");
    assert_eq!(handle["status"], "pending");
    assert_eq!(handle["amount_minor"], 149900);

    let orders = app.gateway.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].notes.get("type").map(String::as_str), Some("course"));
    assert_eq!(
        orders[0].notes.get("courseId").map(String::as_str),
        Some(course.id.to_string().as_str())
    );

    let gateway_order_id = handle["gateway_order_id"].as_str().unwrap();
    let verify = app
        .post_as(
            "learner",
            "/api/v1/payments/verify",
            json!({
                "kind": "course",
                "gateway_order_id": gateway_order_id,
                "gateway_payment_id": "pay_c1",
                "signature": callback_sig(gateway_order_id, "pay_c1"),
            }),
        )
        .await;
    assert_eq!(verify.status(), StatusCode::OK);
    assert_eq!(response_json(verify).await["data"]["status"], "completed");

    let listed = response_json(app.get_as("learner", "/api/v1/enrollments").await).await;
    assert_eq!(listed["data"][0]["course_name"], "Glazing");
    assert_eq!(listed["data"][0]["payment_status"], "completed");

    // Enrolled learners are turned away before any new gateway order
    let again = app
        .post_as(
            "learner",
            "/api/v1/checkout/course",
            json!({ "course_id": course.id }),
        )
        .await;
    assert_eq!(again.status(), StatusCode::CONFLICT);
    assert_eq!(app.gateway.orders().len(), 1);
}

#[tokio::test]
async fn capture_after_failure_keeps_the_enrollment_failed_and_needs_refund() {
    let app = TestApp::new().await;
    let course = app.seed_course("Raku Firing", dec!(899), false).await;

    let handle = response_json(
        app.post_as(
            "learner",
            "/api/v1/checkout/course",
            json!({ "course_id": course.id }),
        )
        .await,
    )
    .await["data"]
        .clone();
    let gateway_order_id = handle["gateway_order_id"].as_str().unwrap();

    let failed = app
        .signed_webhook(&json!({
            "event": "payment.failed",
            "payload": { "payment": { "entity": { "id": "pay_f", "order_id": gateway_order_id } } }
        }))
        .await;
    assert_eq!(response_json(failed).await["data"]["result"]["status"], "failed");

    let body = json!({
        "kind": "course",
        "gateway_order_id": gateway_order_id,
        "gateway_payment_id": "pay_late",
        "signature": callback_sig(gateway_order_id, "pay_late"),
    });

    let late = response_json(
        app.post_as("learner", "/api/v1/payments/verify", body.clone())
            .await,
    )
    .await;
    assert_eq!(late["data"]["status"], "failed");
    assert_eq!(late["data"]["already_settled"], false);
    assert_eq!(late["data"]["refund_required"], true);
    assert_eq!(completed_enrollments(&app, "learner", course.id).await, 0);

    let replay = response_json(app.post_as("learner", "/api/v1/payments/verify", body).await).await;
    assert_eq!(replay["data"]["already_settled"], true);
    assert_eq!(replay["data"]["refund_required"], true);

    let record_id = Uuid::parse_str(handle["record_id"].as_str().unwrap()).unwrap();
    let stored = Enrollment::find_by_id(record_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.payment_status, EnrollmentStatus::Failed);
    assert_eq!(stored.gateway_payment_id.as_deref(), Some("pay_late"));
}

#[tokio::test]
async fn two_paid_attempts_complete_only_one_enrollment() {
    let app = TestApp::new().await;
    let course = app.seed_course("Wheel Throwing", dec!(999), false).await;

    // Two tabs open checkout before either pays
    let mut handles = Vec::new();
    for _ in 0..2 {
        handles.push(
            response_json(
                app.post_as(
                    "learner",
                    "/api/v1/checkout/course",
                    json!({ "course_id": course.id }),
                )
                .await,
            )
            .await["data"]
                .clone(),
        );
    }

    let mut statuses = Vec::new();
    for (i, handle) in handles.iter().enumerate() {
        let gateway_order_id = handle["gateway_order_id"].as_str().unwrap();
        let payment_id = format!("pay_{}", i);
        let response = app
            .post_as(
                "learner",
                "/api/v1/payments/verify",
                json!({
                    "kind": "course",
                    "gateway_order_id": gateway_order_id,
                    "gateway_payment_id": payment_id,
                    "signature": callback_sig(gateway_order_id, &payment_id),
                }),
            )
            .await;
        statuses.push(response.status());
    }

    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
    assert_eq!(completed_enrollments(&app, "learner", course.id).await, 1);
}

#[tokio::test]
async fn redirect_session_requires_payment_and_the_same_user() {
    let app = TestApp::new().await;
    let course = app.seed_course("Kiln Safety", dec!(350), false).await;

    let session = start_session(&app, "learner", course.id).await;
    assert_eq!(session["status"], "pending");
    let session_id = session["gateway_session_id"].as_str().unwrap().to_string();
    assert!(session["checkout_url"].as_str().unwrap().contains(&session_id));

    let requested = app.gateway.sessions();
    assert_eq!(requested[0].amount_minor, 35000);
    assert!(requested[0]
        .success_url
        .ends_with("/success?session_id={CHECKOUT_SESSION_ID}"));

    let unpaid = app
        .post_as(
            "learner",
            "/api/v1/payments/sessions/confirm",
            json!({ "session_id": session_id }),
        )
        .await;
    assert_eq!(unpaid.status(), StatusCode::PAYMENT_REQUIRED);

    app.gateway.mark_session_paid(&session_id);

    let intruder = app
        .post_as(
            "someone-else",
            "/api/v1/payments/sessions/confirm",
            json!({ "session_id": session_id }),
        )
        .await;
    assert_eq!(intruder.status(), StatusCode::FORBIDDEN);

    let confirmed = app
        .post_as(
            "learner",
            "/api/v1/payments/sessions/confirm",
            json!({ "session_id": session_id }),
        )
        .await;
    assert_eq!(confirmed.status(), StatusCode::OK);
    let first = response_json(confirmed).await["data"].clone();
    assert_eq!(first["status"], "completed");

    // Revisiting the success page is harmless
    let revisit = response_json(
        app.post_as(
            "learner",
            "/api/v1/payments/sessions/confirm",
            json!({ "session_id": session_id }),
        )
        .await,
    )
    .await["data"]
        .clone();
    assert_eq!(revisit["record_id"], first["record_id"]);
    assert_eq!(revisit["already_settled"], true);
    assert_eq!(completed_enrollments(&app, "learner", course.id).await, 1);
}

#[tokio::test]
async fn session_completed_webhook_enrolls_once() {
    let app = TestApp::new().await;
    let course = app.seed_course("Raku Firing", dec!(780), false).await;
    let session = start_session(&app, "learner", course.id).await;
    let session_id = session["gateway_session_id"].as_str().unwrap();

    let event = json!({
        "type": "checkout.session.completed",
        "data": { "object": { "id": session_id, "payment_status": "paid" } }
    });

    let first = response_json(app.signed_webhook(&event).await).await;
    assert_eq!(first["data"]["handled"], true);
    assert_eq!(first["data"]["result"]["status"], "completed");

    let replay = response_json(app.signed_webhook(&event).await).await;
    assert_eq!(replay["data"]["result"]["already_settled"], true);
    assert_eq!(completed_enrollments(&app, "learner", course.id).await, 1);
}

#[tokio::test]
async fn unknown_course_is_unavailable() {
    let app = TestApp::new().await;
    let response = app
        .post_as(
            "learner",
            "/api/v1/checkout/course",
            json!({ "course_id": Uuid::new_v4() }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response_json(response).await["code"], "item_unavailable");
}
