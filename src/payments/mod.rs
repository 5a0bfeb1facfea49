//! Boundary to the external payment gateway.
//!
//! Amounts crossing this boundary are integer minor units (paise for INR).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::errors::ServiceError;

pub mod http_gateway;
pub mod signature;

pub use http_gateway::HttpPaymentGateway;

/// Metadata attached to a gateway order so reconciliation can act without
/// re-deriving pricing.
pub type GatewayNotes = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub amount_minor: i64,
    pub currency: String,
    /// Our own reference for the attempt, echoed back by the gateway
    pub receipt: String,
    pub notes: GatewayNotes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCheckoutSessionRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub product_name: String,
    pub success_url: String,
    pub cancel_url: String,
    pub client_reference_id: String,
    pub metadata: GatewayNotes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub payment_status: CheckoutPaymentStatus,
    #[serde(default)]
    pub metadata: GatewayNotes,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status,
            CheckoutPaymentStatus::Paid | CheckoutPaymentStatus::NoPaymentRequired
        )
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Transport(String),

    #[error("gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        ServiceError::Gateway(err.to_string())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a payment order for a signed-callback checkout.
    async fn create_order(&self, request: CreateOrderRequest) -> Result<GatewayOrder, GatewayError>;

    /// Opens a hosted checkout page for the redirect flow.
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, GatewayError>;
}
