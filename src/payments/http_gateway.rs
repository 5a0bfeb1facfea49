use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    CheckoutSession, CreateCheckoutSessionRequest, CreateOrderRequest, GatewayError, GatewayNotes,
    GatewayOrder, PaymentGateway,
};
use crate::config::GatewayConfig;

/// REST client for the payment gateway, authenticated with basic auth
/// (key id / key secret).
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

#[derive(Serialize)]
struct OrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
    notes: &'a GatewayNotes,
}

#[derive(Deserialize)]
struct OrderResponse {
    id: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Serialize)]
struct SessionBody<'a> {
    amount: i64,
    currency: &'a str,
    product_name: &'a str,
    success_url: &'a str,
    cancel_url: &'a str,
    client_reference_id: &'a str,
    metadata: &'a GatewayNotes,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.key_id, Some(&self.key_secret))
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .ok()
                .and_then(|env| env.error.description.or(env.error.message))
                .unwrap_or(text);
            warn!(status = status.as_u16(), "gateway rejected request");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

fn transport(err: reqwest::Error) -> GatewayError {
    GatewayError::Transport(err.to_string())
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(receipt = %request.receipt, amount = request.amount_minor))]
    async fn create_order(&self, request: CreateOrderRequest) -> Result<GatewayOrder, GatewayError> {
        let body = OrderBody {
            amount: request.amount_minor,
            currency: &request.currency,
            receipt: &request.receipt,
            notes: &request.notes,
        };

        let response = self
            .authed(self.client.post(format!("{}/v1/orders", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let order: OrderResponse = Self::parse(response).await?;
        debug!(gateway_order_id = %order.id, "gateway order created");

        Ok(GatewayOrder {
            id: order.id,
            amount_minor: order.amount,
            currency: order.currency,
            status: order.status.unwrap_or_else(|| "created".to_string()),
        })
    }

    #[instrument(skip(self, request), fields(client_reference_id = %request.client_reference_id))]
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let body = SessionBody {
            amount: request.amount_minor,
            currency: &request.currency,
            product_name: &request.product_name,
            success_url: &request.success_url,
            cancel_url: &request.cancel_url,
            client_reference_id: &request.client_reference_id,
            metadata: &request.metadata,
        };

        let response = self
            .authed(
                self.client
                    .post(format!("{}/v1/checkout/sessions", self.base_url)),
            )
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        Self::parse(response).await
    }

    #[instrument(skip(self))]
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, GatewayError> {
        let response = self
            .authed(self.client.get(format!(
                "{}/v1/checkout/sessions/{}",
                self.base_url, session_id
            )))
            .send()
            .await
            .map_err(transport)?;
        Self::parse(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::CheckoutPaymentStatus;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway_for(server: &MockServer) -> HttpPaymentGateway {
        HttpPaymentGateway::new(&GatewayConfig {
            base_url: server.uri(),
            key_id: "rzp_test_key".into(),
            key_secret: "secret".into(),
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_order_posts_minor_units_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "amount": 60000,
                "currency": "INR",
                "receipt": "rcpt_1",
                "notes": {"userId": "user_1"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "order_ABC",
                "amount": 60000,
                "currency": "INR",
                "status": "created"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut notes = GatewayNotes::new();
        notes.insert("userId".into(), "user_1".into());
        let order = gateway_for(&server)
            .create_order(CreateOrderRequest {
                amount_minor: 60000,
                currency: "INR".into(),
                receipt: "rcpt_1".into(),
                notes,
            })
            .await
            .unwrap();

        assert_eq!(order.id, "order_ABC");
        assert_eq!(order.amount_minor, 60000);
    }

    #[tokio::test]
    async fn non_success_status_becomes_rejected_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": "BAD_REQUEST_ERROR", "description": "amount too small"}
            })))
            .mount(&server)
            .await;

        let err = gateway_for(&server)
            .create_order(CreateOrderRequest {
                amount_minor: 1,
                currency: "INR".into(),
                receipt: "r".into(),
                notes: GatewayNotes::new(),
            })
            .await
            .unwrap_err();

        assert_matches!(err, GatewayError::Rejected { status: 400, ref message } if message == "amount too small");
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_transport_error() {
        let gateway = HttpPaymentGateway::new(&GatewayConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();

        let err = gateway.retrieve_checkout_session("cs_1").await.unwrap_err();
        assert_matches!(err, GatewayError::Transport(_));
    }

    #[tokio::test]
    async fn retrieve_checkout_session_parses_payment_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_123",
                "url": null,
                "payment_status": "paid",
                "metadata": {"courseId": "c1"}
            })))
            .mount(&server)
            .await;

        let session = gateway_for(&server)
            .retrieve_checkout_session("cs_123")
            .await
            .unwrap();
        assert_eq!(session.payment_status, CheckoutPaymentStatus::Paid);
        assert!(session.is_paid());
        assert_eq!(session.metadata.get("courseId").map(String::as_str), Some("c1"));
    }
}
