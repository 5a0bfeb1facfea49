#![allow(dead_code)]

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use settlement_api::{
    auth::{AuthConfig, ADMIN_ROLE},
    config::AppConfig,
    db,
    entities::{course, product, product_variant},
    events::{self, EventSender},
    handlers::AppServices,
    logging::{setup_logger, LoggerConfig, LoggingState},
    payments::{
        signature::{callback_signature, GATEWAY_SIGNATURE_HEADER},
        CheckoutPaymentStatus, CheckoutSession, CreateCheckoutSessionRequest, CreateOrderRequest,
        GatewayError, GatewayOrder, PaymentGateway,
    },
    AppState,
};
use sha2::Sha256;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const GATEWAY_SECRET: &str = "test_gateway_key_secret";
pub const JWT_SECRET: &str =
    "integration_test_jwt_secret_that_is_comfortably_longer_than_sixty_four_chars";

/// In-process stand-in for the payment gateway. Records every order it is
/// asked to open and reports sessions as paid once a test says so.
#[derive(Default)]
pub struct RecordingGateway {
    orders: Mutex<Vec<CreateOrderRequest>>,
    sessions: Mutex<Vec<CreateCheckoutSessionRequest>>,
    paid_sessions: Mutex<HashSet<String>>,
    fail_next: Mutex<bool>,
}

impl RecordingGateway {
    pub fn orders(&self) -> Vec<CreateOrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> Vec<CreateCheckoutSessionRequest> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn mark_session_paid(&self, session_id: &str) {
        self.paid_sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string());
    }

    pub fn fail_next_call(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    fn take_failure(&self) -> Result<(), GatewayError> {
        let mut flag = self.fail_next.lock().unwrap();
        if *flag {
            *flag = false;
            return Err(GatewayError::Transport("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn create_order(&self, request: CreateOrderRequest) -> Result<GatewayOrder, GatewayError> {
        self.take_failure()?;
        let mut orders = self.orders.lock().unwrap();
        orders.push(request.clone());
        Ok(GatewayOrder {
            id: format!("order_test_{}", orders.len()),
            amount_minor: request.amount_minor,
            currency: request.currency,
            status: "created".into(),
        })
    }

    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        self.take_failure()?;
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push(request.clone());
        let id = format!("cs_test_{}", sessions.len());
        Ok(CheckoutSession {
            url: Some(format!("https://pay.test/{}", id)),
            id,
            payment_status: CheckoutPaymentStatus::Unpaid,
            metadata: request.metadata,
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, GatewayError> {
        let paid = self.paid_sessions.lock().unwrap().contains(session_id);
        Ok(CheckoutSession {
            id: session_id.to_string(),
            url: None,
            payment_status: if paid {
                CheckoutPaymentStatus::Paid
            } else {
                CheckoutPaymentStatus::Unpaid
            },
            metadata: Default::default(),
        })
    }
}

/// Full router over a throwaway SQLite file with migrations applied.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<RecordingGateway>,
    auth: Arc<AuthConfig>,
    _db_dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir for sqlite");
        let db_path = db_dir.path().join("settlement.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.gateway.key_id = "key_test".to_string();
        cfg.gateway.key_secret = GATEWAY_SECRET.to_string();

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(RecordingGateway::default());
        let services =
            AppServices::new(db_arc.clone(), event_sender.clone(), gateway.clone(), &cfg);
        let auth = Arc::new(AuthConfig::from(&cfg));

        let state = AppState {
            db: db_arc,
            config: Arc::new(cfg),
            auth: auth.clone(),
            services,
            event_sender,
        };

        let logging_state = Arc::new(LoggingState::new(setup_logger(LoggerConfig {
            async_buffer_size: 256,
            use_color: false,
        })));
        let router = settlement_api::build_router(state.clone(), logging_state);

        Self {
            router,
            state,
            gateway,
            auth,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user_id: &str) -> String {
        self.auth
            .issue_token(user_id, &[], 3600)
            .expect("issue test token")
    }

    pub fn admin_token(&self) -> String {
        self.auth
            .issue_token("admin-1", &[ADMIN_ROLE], 3600)
            .expect("issue admin token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn post_as(&self, user_id: &str, uri: &str, body: Value) -> Response {
        let token = self.token_for(user_id);
        self.request(Method::POST, uri, Some(body), Some(&token))
            .await
    }

    pub async fn get_as(&self, user_id: &str, uri: &str) -> Response {
        let token = self.token_for(user_id);
        self.request(Method::GET, uri, None, Some(&token)).await
    }

    /// Delivers a webhook body signed with the gateway secret.
    pub async fn signed_webhook(&self, payload: &Value) -> Response {
        let raw = serde_json::to_vec(payload).expect("serialize webhook");
        let signature = body_signature(GATEWAY_SECRET, &raw);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json")
            .header(GATEWAY_SIGNATURE_HEADER, signature)
            .body(Body::from(raw))
            .expect("failed to build webhook request");
        self.send(request).await
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(None),
            price: Set(price),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_variant(
        &self,
        product_id: Uuid,
        sku: &str,
        price: Option<Decimal>,
        stock: i32,
    ) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            sku: Set(sku.to_string()),
            name: Set(format!("Variant {}", sku)),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed variant")
    }

    pub async fn seed_course(&self, name: &str, price: Decimal, is_free: bool) -> course::Model {
        let now = Utc::now();
        course::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(None),
            price: Set(price),
            is_free: Set(is_free),
            is_published: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed course")
    }

    /// Creates a coupon through the admin API and returns its JSON view.
    pub async fn create_coupon(&self, body: Value) -> Value {
        let token = self.admin_token();
        let response = self
            .request(Method::POST, "/api/v1/admin/coupons", Some(body), Some(&token))
            .await;
        assert_eq!(response.status(), 201, "coupon creation failed");
        response_json(response).await["data"].clone()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a decimal that may have been serialized as a string or a number.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("expected a decimal, got {other}"),
    }
}

/// Signature the gateway would attach to a successful checkout callback.
pub fn callback_sig(gateway_order_id: &str, gateway_payment_id: &str) -> String {
    callback_signature(GATEWAY_SECRET, gateway_order_id, gateway_payment_id)
}

pub fn body_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
