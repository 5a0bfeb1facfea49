use crate::{
    config::AppConfig,
    db::is_unique_violation,
    entities::{
        enrollment::{self, completion_key},
        order, order_item, payment_session, Enrollment, EnrollmentStatus, OrderStatus,
        SessionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender, SettlementKind},
    metrics,
    payments::{CreateCheckoutSessionRequest, CreateOrderRequest, GatewayNotes, PaymentGateway},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::{
    catalog_service::{CatalogService, LineItem, ResolvedCourse, ResolvedLineItem},
    coupon_service::CouponService,
    pricing_service::{to_minor_units, PriceBreakdown, PricingService, ShippingMethod},
};

fn validate_address(address: &serde_json::Value) -> Result<(), ValidationError> {
    match address.as_object() {
        Some(fields) if !fields.is_empty() => Ok(()),
        _ => {
            let mut err = ValidationError::new("shipping_address");
            err.message = Some("Shipping address is required".into());
            Err(err)
        }
    }
}

/// Cart checkout as submitted by the storefront.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CartSettlementRequest {
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<LineItem>,
    pub shipping_method: String,
    /// Snapshot stored on the order as-is.
    #[validate(custom = "validate_address")]
    #[schema(value_type = Object)]
    pub shipping_address: serde_json::Value,
    #[serde(default)]
    #[validate(length(max = 64))]
    pub coupon_code: Option<String>,
}

/// Price preview of a cart. Nothing is persisted and the gateway is not called.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct QuoteRequest {
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<LineItem>,
    pub shipping_method: String,
    #[serde(default)]
    #[validate(length(max = 64))]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AppliedCoupon {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount: Decimal,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Quote {
    pub items: Vec<ResolvedLineItem>,
    pub shipping_method: ShippingMethod,
    pub breakdown: PriceBreakdown,
    pub coupon: Option<AppliedCoupon>,
    pub currency: String,
}

/// What the client needs to open the gateway's checkout for a settlement.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SettlementHandle {
    pub kind: SettlementKind,
    /// Order or enrollment id
    pub record_id: Uuid,
    pub status: String,
    /// `None` when no payment was needed
    pub gateway_order_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    /// Public gateway key for the client-side checkout widget
    pub key_id: String,
    pub breakdown: Option<PriceBreakdown>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutSessionHandle {
    pub payment_session_id: Option<Uuid>,
    pub gateway_session_id: Option<String>,
    pub checkout_url: Option<String>,
    /// Set when the course was free and enrollment completed immediately
    pub enrollment_id: Option<Uuid>,
    pub status: String,
}

/// Values the assembler needs from configuration.
#[derive(Debug, Clone)]
pub struct SettlementSettings {
    pub currency: String,
    pub key_id: String,
    pub public_app_url: String,
}

impl From<&AppConfig> for SettlementSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            currency: cfg.settlement_currency.clone(),
            key_id: cfg.gateway.key_id.clone(),
            public_app_url: cfg.public_app_url.trim_end_matches('/').to_string(),
        }
    }
}

struct PricedCart {
    items: Vec<ResolvedLineItem>,
    method: ShippingMethod,
    breakdown: PriceBreakdown,
    coupon: Option<AppliedCoupon>,
}

/// Turns a cart or a course selection into a gateway payment order plus a
/// pending local record.
///
/// The gateway order is always opened first. Nothing is written locally until
/// it exists, so a failure in between leaves at most an orphaned gateway order.
#[derive(Clone)]
pub struct SettlementService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<CatalogService>,
    coupons: Arc<CouponService>,
    pricing: Arc<PricingService>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    settings: SettlementSettings,
}

impl SettlementService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<CatalogService>,
        coupons: Arc<CouponService>,
        pricing: Arc<PricingService>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            db,
            catalog,
            coupons,
            pricing,
            gateway,
            event_sender,
            settings,
        }
    }

    async fn price_cart(
        &self,
        user_id: &str,
        items: &[LineItem],
        shipping_method: &str,
        coupon_code: Option<&str>,
    ) -> Result<PricedCart, ServiceError> {
        let method = ShippingMethod::from_request(shipping_method)?;
        let items = self.catalog.resolve_line_items(items).await?;
        let subtotal = super::pricing_service::subtotal(&items);

        let coupon = match coupon_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => {
                let (coupon, discount) = self
                    .coupons
                    .evaluate(code, user_id, subtotal)
                    .await?
                    .into_discount()?;
                Some(AppliedCoupon {
                    coupon_id: coupon.id,
                    code: coupon.code,
                    discount,
                })
            }
            None => None,
        };

        let discount = coupon.as_ref().map_or(Decimal::ZERO, |c| c.discount);
        let breakdown = self.pricing.price(&items, method, discount);

        Ok(PricedCart {
            items,
            method,
            breakdown,
            coupon,
        })
    }

    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn quote(&self, user_id: &str, request: QuoteRequest) -> Result<Quote, ServiceError> {
        request.validate()?;
        let priced = self
            .price_cart(
                user_id,
                &request.items,
                &request.shipping_method,
                request.coupon_code.as_deref(),
            )
            .await?;

        Ok(Quote {
            items: priced.items,
            shipping_method: priced.method,
            breakdown: priced.breakdown,
            coupon: priced.coupon,
            currency: self.settings.currency.clone(),
        })
    }

    #[instrument(skip(self, request), fields(user_id = %user_id, lines = request.items.len()))]
    pub async fn settle_cart(
        &self,
        user_id: &str,
        request: CartSettlementRequest,
    ) -> Result<SettlementHandle, ServiceError> {
        request.validate()?;
        let priced = self
            .price_cart(
                user_id,
                &request.items,
                &request.shipping_method,
                request.coupon_code.as_deref(),
            )
            .await?;

        if priced.breakdown.payable <= Decimal::ZERO {
            return Err(ServiceError::Validation(
                "Payable amount must be greater than zero".into(),
            ));
        }
        let amount_minor = to_minor_units(priced.breakdown.payable)?;

        let order_id = Uuid::new_v4();
        let mut notes = GatewayNotes::new();
        notes.insert("type".into(), SettlementKind::Cart.to_string());
        notes.insert("userId".into(), user_id.to_string());
        notes.insert("orderId".into(), order_id.to_string());
        notes.insert("shippingMethod".into(), priced.method.to_string());
        notes.insert("address".into(), request.shipping_address.to_string());
        if let Some(coupon) = &priced.coupon {
            notes.insert("couponId".into(), coupon.coupon_id.to_string());
            notes.insert("couponCode".into(), coupon.code.clone());
            notes.insert("discountAmount".into(), coupon.discount.to_string());
        }

        let gateway_order = self
            .gateway
            .create_order(CreateOrderRequest {
                amount_minor,
                currency: self.settings.currency.clone(),
                receipt: format!("rcpt_{}", order_id.simple()),
                notes,
            })
            .await?;

        let persisted = self
            .persist_order(
                order_id,
                user_id,
                &priced,
                request.shipping_address,
                &gateway_order.id,
            )
            .await;
        if let Err(e) = persisted {
            error!(
                gateway_order_id = %gateway_order.id,
                %order_id,
                error = %e,
                "gateway order created but local order could not be stored"
            );
            return Err(ServiceError::Storage(format!(
                "order for gateway order {} was not stored",
                gateway_order.id
            )));
        }

        info!(%order_id, gateway_order_id = %gateway_order.id, payable = %priced.breakdown.payable, "cart settlement created");
        metrics::record_settlement(SettlementKind::Cart.as_ref());
        self.event_sender
            .send_or_log(Event::SettlementCreated {
                kind: SettlementKind::Cart,
                record_id: order_id,
                gateway_reference: Some(gateway_order.id.clone()),
                amount: priced.breakdown.payable,
            })
            .await;

        Ok(SettlementHandle {
            kind: SettlementKind::Cart,
            record_id: order_id,
            status: OrderStatus::Pending.to_string(),
            gateway_order_id: Some(gateway_order.id),
            amount_minor: gateway_order.amount_minor,
            currency: gateway_order.currency,
            key_id: self.settings.key_id.clone(),
            breakdown: Some(priced.breakdown),
        })
    }

    async fn persist_order(
        &self,
        order_id: Uuid,
        user_id: &str,
        priced: &PricedCart,
        shipping_address: serde_json::Value,
        gateway_order_id: &str,
    ) -> Result<(), DbErr> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id.to_string()),
            subtotal: Set(priced.breakdown.subtotal),
            shipping_cost: Set(priced.breakdown.shipping),
            discount_amount: Set(priced.breakdown.discount),
            total_amount: Set(priced.breakdown.payable),
            currency: Set(self.settings.currency.clone()),
            coupon_id: Set(priced.coupon.as_ref().map(|c| c.coupon_id)),
            status: Set(OrderStatus::Pending),
            shipping_address: Set(shipping_address),
            shipping_method: Set(priced.method.to_string()),
            gateway_order_id: Set(gateway_order_id.to_string()),
            gateway_payment_id: Set(None),
            notes: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            paid_at: Set(None),
        }
        .insert(&txn)
        .await?;

        for item in &priced.items {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                variant_id: Set(item.variant_id),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                line_total: Set(item.line_total()),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await
    }

    /// Rejects a second purchase of a course the user already completed.
    async fn ensure_not_enrolled(&self, user_id: &str, course_id: Uuid) -> Result<(), ServiceError> {
        let existing = Enrollment::find()
            .filter(enrollment::Column::CompletionKey.eq(completion_key(user_id, course_id)))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::AlreadyEnrolled(format!(
                "Already enrolled in course {}",
                course_id
            )));
        }
        Ok(())
    }

    async fn enroll_free(
        &self,
        user_id: &str,
        course: &ResolvedCourse,
    ) -> Result<enrollment::Model, ServiceError> {
        let now = Utc::now();
        let enrollment = enrollment::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id.to_string()),
            course_id: Set(course.course_id),
            payment_status: Set(EnrollmentStatus::Completed),
            gateway_order_id: Set(None),
            gateway_payment_id: Set(None),
            payment_session_id: Set(None),
            completion_key: Set(Some(completion_key(user_id, course.course_id))),
            enrolled_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::AlreadyEnrolled(format!(
                    "Already enrolled in course {}",
                    course.course_id
                ))
            } else {
                ServiceError::DatabaseError(e)
            }
        })?;

        info!(enrollment_id = %enrollment.id, course_id = %course.course_id, "free course enrollment completed");
        metrics::record_settlement(SettlementKind::Course.as_ref());
        self.event_sender
            .send_or_log(Event::EnrollmentCompleted {
                enrollment_id: enrollment.id,
                course_id: course.course_id,
            })
            .await;
        Ok(enrollment)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn settle_course(
        &self,
        user_id: &str,
        course_id: Uuid,
    ) -> Result<SettlementHandle, ServiceError> {
        let course = self.catalog.resolve_course(course_id).await?;
        self.ensure_not_enrolled(user_id, course_id).await?;

        if course.is_free {
            let enrollment = self.enroll_free(user_id, &course).await?;
            return Ok(SettlementHandle {
                kind: SettlementKind::Course,
                record_id: enrollment.id,
                status: "completed".into(),
                gateway_order_id: None,
                amount_minor: 0,
                currency: self.settings.currency.clone(),
                key_id: self.settings.key_id.clone(),
                breakdown: None,
            });
        }

        let enrollment_id = Uuid::new_v4();
        let mut notes = GatewayNotes::new();
        notes.insert("type".into(), SettlementKind::Course.to_string());
        notes.insert("userId".into(), user_id.to_string());
        notes.insert("courseId".into(), course_id.to_string());
        notes.insert("enrollmentId".into(), enrollment_id.to_string());

        let gateway_order = self
            .gateway
            .create_order(CreateOrderRequest {
                amount_minor: to_minor_units(course.fee)?,
                currency: self.settings.currency.clone(),
                receipt: format!("rcpt_{}", enrollment_id.simple()),
                notes,
            })
            .await?;

        let now = Utc::now();
        let inserted = enrollment::ActiveModel {
            id: Set(enrollment_id),
            user_id: Set(user_id.to_string()),
            course_id: Set(course_id),
            payment_status: Set(EnrollmentStatus::Pending),
            gateway_order_id: Set(Some(gateway_order.id.clone())),
            gateway_payment_id: Set(None),
            payment_session_id: Set(None),
            completion_key: Set(None),
            enrolled_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await;
        if let Err(e) = inserted {
            error!(
                gateway_order_id = %gateway_order.id,
                %enrollment_id,
                error = %e,
                "gateway order created but local enrollment could not be stored"
            );
            return Err(ServiceError::Storage(format!(
                "enrollment for gateway order {} was not stored",
                gateway_order.id
            )));
        }

        info!(%enrollment_id, gateway_order_id = %gateway_order.id, fee = %course.fee, "course settlement created");
        metrics::record_settlement(SettlementKind::Course.as_ref());
        self.event_sender
            .send_or_log(Event::SettlementCreated {
                kind: SettlementKind::Course,
                record_id: enrollment_id,
                gateway_reference: Some(gateway_order.id.clone()),
                amount: course.fee,
            })
            .await;

        Ok(SettlementHandle {
            kind: SettlementKind::Course,
            record_id: enrollment_id,
            status: EnrollmentStatus::Pending.to_value(),
            gateway_order_id: Some(gateway_order.id),
            amount_minor: gateway_order.amount_minor,
            currency: gateway_order.currency,
            key_id: self.settings.key_id.clone(),
            breakdown: None,
        })
    }

    /// Redirect flow: opens a hosted checkout page for the course and records
    /// a pending payment session.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn create_course_session(
        &self,
        user_id: &str,
        course_id: Uuid,
    ) -> Result<CheckoutSessionHandle, ServiceError> {
        let course = self.catalog.resolve_course(course_id).await?;
        self.ensure_not_enrolled(user_id, course_id).await?;

        if course.is_free {
            let enrollment = self.enroll_free(user_id, &course).await?;
            return Ok(CheckoutSessionHandle {
                payment_session_id: None,
                gateway_session_id: None,
                checkout_url: None,
                enrollment_id: Some(enrollment.id),
                status: "completed".into(),
            });
        }

        let mut metadata = GatewayNotes::new();
        metadata.insert("type".into(), SettlementKind::Course.to_string());
        metadata.insert("userId".into(), user_id.to_string());
        metadata.insert("courseId".into(), course_id.to_string());

        let base = &self.settings.public_app_url;
        let session = self
            .gateway
            .create_checkout_session(CreateCheckoutSessionRequest {
                amount_minor: to_minor_units(course.fee)?,
                currency: self.settings.currency.clone(),
                product_name: course.name.clone(),
                success_url: format!(
                    "{}/courses/{}/success?session_id={{CHECKOUT_SESSION_ID}}",
                    base, course_id
                ),
                cancel_url: format!("{}/courses/{}", base, course_id),
                client_reference_id: user_id.to_string(),
                metadata,
            })
            .await?;

        let payment_session_id = Uuid::new_v4();
        let inserted = payment_session::ActiveModel {
            id: Set(payment_session_id),
            gateway_session_id: Set(session.id.clone()),
            user_id: Set(user_id.to_string()),
            course_id: Set(course_id),
            amount: Set(course.fee),
            currency: Set(self.settings.currency.clone()),
            status: Set(SessionStatus::Pending),
            checkout_url: Set(session.url.clone()),
            created_at: Set(Utc::now()),
            completed_at: Set(None),
        }
        .insert(&*self.db)
        .await;
        if let Err(e) = inserted {
            error!(
                gateway_session_id = %session.id,
                error = %e,
                "gateway checkout session created but local session could not be stored"
            );
            return Err(ServiceError::Storage(format!(
                "payment session {} was not stored",
                session.id
            )));
        }

        info!(%payment_session_id, gateway_session_id = %session.id, "course checkout session created");
        metrics::record_settlement(SettlementKind::Course.as_ref());
        self.event_sender
            .send_or_log(Event::SettlementCreated {
                kind: SettlementKind::Course,
                record_id: payment_session_id,
                gateway_reference: Some(session.id.clone()),
                amount: course.fee,
            })
            .await;

        Ok(CheckoutSessionHandle {
            payment_session_id: Some(payment_session_id),
            gateway_session_id: Some(session.id),
            checkout_url: session.url,
            enrollment_id: None,
            status: SessionStatus::Pending.to_value(),
        })
    }
}
