use crate::{
    config::GatewayConfig,
    db::is_unique_violation,
    entities::{
        enrollment::{self, completion_key},
        order, payment_session, Enrollment, EnrollmentStatus, Order, OrderStatus, PaymentSession,
        SessionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender, SettlementKind},
    metrics,
    payments::{
        signature::{verify_callback_signature, verify_webhook_signature},
        PaymentGateway,
    },
};
use axum::http::HeaderMap;
use chrono::Utc;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::coupon_service::{redeem, RedemptionOutcome};

/// Payment confirmation relayed by the client after the gateway checkout.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ReconcileRequest {
    pub kind: SettlementKind,
    #[validate(length(min = 1, max = 128))]
    pub gateway_order_id: String,
    #[validate(length(min = 1, max = 128))]
    pub gateway_payment_id: String,
    #[validate(length(min = 1, max = 256))]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationResult {
    pub kind: SettlementKind,
    /// Order or enrollment id
    pub record_id: Uuid,
    pub status: String,
    /// True when the record was already terminal and nothing was applied
    pub already_settled: bool,
    /// The payment was captured but the record could not take it; it has to
    /// be refunded at the gateway.
    #[serde(default)]
    pub refund_required: bool,
}

impl ReconciliationResult {
    fn order(order: &order::Model, already_settled: bool) -> Self {
        Self {
            kind: SettlementKind::Cart,
            record_id: order.id,
            status: order.status.to_string(),
            already_settled,
            refund_required: false,
        }
    }

    fn enrollment(enrollment: &enrollment::Model, already_settled: bool) -> Self {
        Self {
            kind: SettlementKind::Course,
            record_id: enrollment.id,
            status: enrollment.payment_status.to_value(),
            already_settled,
            refund_required: false,
        }
    }

    fn with_refund_required(mut self, refund_required: bool) -> Self {
        self.refund_required = refund_required;
        self
    }
}

/// What a verified capture means for the order it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureDisposition {
    Settle,
    /// This payment was already applied, or already flagged for refund.
    Replay { refund_required: bool },
    /// Money arrived for an order that can no longer take it.
    RefundRequired,
}

fn refund_note(gateway_payment_id: &str, status: OrderStatus) -> String {
    format!(
        "Refund required: payment {} captured after the order was {}",
        gateway_payment_id, status
    )
}

fn capture_disposition(order: &order::Model, gateway_payment_id: &str) -> CaptureDisposition {
    if order.status.accepts_capture() {
        return CaptureDisposition::Settle;
    }

    let flagged = order.notes.as_deref().is_some_and(|notes| {
        notes.contains(&format!("payment {} captured", gateway_payment_id))
    });
    if flagged {
        return CaptureDisposition::Replay {
            refund_required: true,
        };
    }

    match (order.status, order.gateway_payment_id.as_deref()) {
        (status, _) if status.is_closed_unpaid() => CaptureDisposition::RefundRequired,
        (_, Some(stored)) if stored != gateway_payment_id => CaptureDisposition::RefundRequired,
        _ => CaptureDisposition::Replay {
            refund_required: false,
        },
    }
}

/// Attempts at applying a capture when the record keeps changing underneath.
const MAX_SETTLE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub event: String,
    pub handled: bool,
    pub result: Option<ReconciliationResult>,
}

/// Moves pending orders, enrollments and payment sessions to their terminal
/// state once the gateway confirms payment.
///
/// Every transition is a guarded update from the status that was read; a
/// record that already took the payment is reported as-is, which makes
/// repeated callbacks safe. A capture that lands on a closed record is kept
/// and flagged for refund instead of being dropped.
#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    gateway_config: GatewayConfig,
}

impl ReconciliationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        gateway_config: GatewayConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
            gateway_config,
        }
    }

    fn reject_signature(&self, source: &str, reference: &str) -> ServiceError {
        metrics::record_signature_rejection();
        metrics::record_reconciliation("invalid_signature");
        warn!(source, reference, "payment signature verification failed");
        ServiceError::InvalidSignature
    }

    /// Verifies a signed payment callback and settles the record it names.
    #[instrument(skip(self, request), fields(kind = %request.kind, gateway_order_id = %request.gateway_order_id))]
    pub async fn reconcile(
        &self,
        request: ReconcileRequest,
    ) -> Result<ReconciliationResult, ServiceError> {
        request.validate()?;

        if !verify_callback_signature(
            &self.gateway_config.key_secret,
            &request.gateway_order_id,
            &request.gateway_payment_id,
            &request.signature,
        ) {
            return Err(self.reject_signature("callback", &request.gateway_order_id));
        }

        match request.kind {
            SettlementKind::Cart => {
                self.mark_order_paid(&request.gateway_order_id, &request.gateway_payment_id)
                    .await
            }
            SettlementKind::Course => {
                self.complete_enrollment(&request.gateway_order_id, &request.gateway_payment_id)
                    .await
            }
        }
    }

    /// `pending -> paid`, recording the coupon usage in the same transaction.
    pub async fn mark_order_paid(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<ReconciliationResult, ServiceError> {
        for attempt in 1..=MAX_SETTLE_ATTEMPTS {
            if let Some(result) = self
                .try_mark_order_paid(gateway_order_id, gateway_payment_id)
                .await?
            {
                return Ok(result);
            }
            debug!(attempt, %gateway_order_id, "order changed while settling, re-reading");
        }
        Err(ServiceError::Storage(format!(
            "order for gateway order {} kept changing while settling",
            gateway_order_id
        )))
    }

    /// One guarded attempt; `None` means the order moved and must be re-read.
    async fn try_mark_order_paid(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<Option<ReconciliationResult>, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find()
            .filter(order::Column::GatewayOrderId.eq(gateway_order_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::UnknownOrder(gateway_order_id.to_string()))?;

        match capture_disposition(&order, gateway_payment_id) {
            CaptureDisposition::Settle => {}
            CaptureDisposition::Replay { refund_required } => {
                txn.rollback().await?;
                debug!(order_id = %order.id, status = %order.status, "order already settled");
                metrics::record_reconciliation("already_settled");
                return Ok(Some(
                    ReconciliationResult::order(&order, true).with_refund_required(refund_required),
                ));
            }
            CaptureDisposition::RefundRequired => {
                return self
                    .flag_order_refund(txn, &order, gateway_payment_id)
                    .await;
            }
        }

        let now = Utc::now();
        let updated = Order::update_many()
            .set(order::ActiveModel {
                status: Set(OrderStatus::Paid),
                gateway_payment_id: Set(Some(gateway_payment_id.to_string())),
                paid_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(None);
        }

        let mut events = vec![Event::OrderPaid {
            order_id: order.id,
            gateway_payment_id: gateway_payment_id.to_string(),
        }];

        if let Some(coupon_id) = order.coupon_id {
            match redeem(&txn, coupon_id, &order.user_id, order.id, now).await? {
                RedemptionOutcome::Redeemed(_) => {
                    events.push(Event::CouponRedeemed {
                        coupon_id,
                        order_id: order.id,
                    });
                }
                RedemptionOutcome::AlreadyRecorded => {}
                RedemptionOutcome::Rejected(rejection) => {
                    // Payment already went through; keep the order paid and
                    // leave a trail for whoever reviews the discount.
                    warn!(
                        order_id = %order.id,
                        %coupon_id,
                        reason = %rejection.reason,
                        "coupon limit reached before payment confirmed"
                    );
                    Order::update_many()
                        .set(order::ActiveModel {
                            notes: Set(Some(format!(
                                "Coupon not redeemed at payment: {}",
                                rejection.message
                            ))),
                            ..Default::default()
                        })
                        .filter(order::Column::Id.eq(order.id))
                        .exec(&txn)
                        .await?;

                    events.push(Event::CouponRedemptionRejected {
                        coupon_id,
                        order_id: order.id,
                        reason: rejection.reason.to_string(),
                    });
                }
            }
        }

        txn.commit().await?;

        info!(order_id = %order.id, %gateway_payment_id, "order paid");
        metrics::record_reconciliation("paid");
        for event in events {
            self.event_sender.send_or_log(event).await;
        }

        let current = self.current_order(order.id).await?;
        Ok(Some(ReconciliationResult::order(&current, false)))
    }

    /// Keeps the captured payment id on a closed order and raises the refund
    /// alert. The order's status is left as it is.
    async fn flag_order_refund(
        &self,
        txn: DatabaseTransaction,
        order: &order::Model,
        gateway_payment_id: &str,
    ) -> Result<Option<ReconciliationResult>, ServiceError> {
        let note = refund_note(gateway_payment_id, order.status);
        let notes = match order.notes.as_deref() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, note),
            _ => note,
        };

        let updated = Order::update_many()
            .set(order::ActiveModel {
                gateway_payment_id: Set(order
                    .gateway_payment_id
                    .clone()
                    .or_else(|| Some(gateway_payment_id.to_string()))),
                notes: Set(Some(notes)),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(order.status))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(None);
        }
        txn.commit().await?;

        error!(
            order_id = %order.id,
            status = %order.status,
            %gateway_payment_id,
            "payment captured for a closed order; refund required"
        );
        self.raise_refund(SettlementKind::Cart, order.id, gateway_payment_id)
            .await;

        let current = self.current_order(order.id).await?;
        Ok(Some(
            ReconciliationResult::order(&current, false).with_refund_required(true),
        ))
    }

    /// Stores the captured payment id on a failed enrollment and raises the
    /// refund alert. The enrollment stays failed.
    async fn flag_enrollment_refund(
        &self,
        enrollment: &enrollment::Model,
        gateway_payment_id: &str,
    ) -> Result<Option<ReconciliationResult>, ServiceError> {
        let updated = Enrollment::update_many()
            .set(enrollment::ActiveModel {
                gateway_payment_id: Set(Some(gateway_payment_id.to_string())),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(enrollment::Column::Id.eq(enrollment.id))
            .filter(enrollment::Column::PaymentStatus.eq(EnrollmentStatus::Failed))
            .filter(enrollment::Column::GatewayPaymentId.is_null())
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            return Ok(None);
        }

        error!(
            enrollment_id = %enrollment.id,
            %gateway_payment_id,
            "payment captured for a failed enrollment; refund required"
        );
        self.raise_refund(SettlementKind::Course, enrollment.id, gateway_payment_id)
            .await;

        let current = Enrollment::find_by_id(enrollment.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Enrollment {} not found", enrollment.id))
            })?;
        Ok(Some(
            ReconciliationResult::enrollment(&current, false).with_refund_required(true),
        ))
    }

    async fn raise_refund(&self, kind: SettlementKind, record_id: Uuid, gateway_payment_id: &str) {
        metrics::record_reconciliation("refund_required");
        self.event_sender
            .send_or_log(Event::RefundRequired {
                kind,
                record_id,
                gateway_payment_id: gateway_payment_id.to_string(),
            })
            .await;
    }

    /// `pending -> completed` for an enrollment opened with a gateway order.
    pub async fn complete_enrollment(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<ReconciliationResult, ServiceError> {
        for attempt in 1..=MAX_SETTLE_ATTEMPTS {
            if let Some(result) = self
                .try_complete_enrollment(gateway_order_id, gateway_payment_id)
                .await?
            {
                return Ok(result);
            }
            debug!(attempt, %gateway_order_id, "enrollment changed while settling, re-reading");
        }
        Err(ServiceError::Storage(format!(
            "enrollment for gateway order {} kept changing while settling",
            gateway_order_id
        )))
    }

    async fn try_complete_enrollment(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<Option<ReconciliationResult>, ServiceError> {
        let enrollment = Enrollment::find()
            .filter(enrollment::Column::GatewayOrderId.eq(gateway_order_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::UnknownOrder(gateway_order_id.to_string()))?;

        match enrollment.payment_status {
            EnrollmentStatus::Pending => {}
            _ if enrollment.gateway_payment_id.as_deref() == Some(gateway_payment_id) => {
                metrics::record_reconciliation("already_settled");
                let refund_required = enrollment.payment_status == EnrollmentStatus::Failed;
                return Ok(Some(
                    ReconciliationResult::enrollment(&enrollment, true)
                        .with_refund_required(refund_required),
                ));
            }
            EnrollmentStatus::Failed if enrollment.gateway_payment_id.is_none() => {
                return self
                    .flag_enrollment_refund(&enrollment, gateway_payment_id)
                    .await;
            }
            _ => {
                // Another payment already sits on this record; there is
                // nowhere local to keep this one.
                error!(
                    enrollment_id = %enrollment.id,
                    status = %enrollment.payment_status.to_value(),
                    %gateway_order_id,
                    %gateway_payment_id,
                    "second payment captured for a closed enrollment; refund required"
                );
                self.raise_refund(SettlementKind::Course, enrollment.id, gateway_payment_id)
                    .await;
                return Ok(Some(
                    ReconciliationResult::enrollment(&enrollment, false).with_refund_required(true),
                ));
            }
        }

        let now = Utc::now();
        let updated = Enrollment::update_many()
            .set(enrollment::ActiveModel {
                payment_status: Set(EnrollmentStatus::Completed),
                gateway_payment_id: Set(Some(gateway_payment_id.to_string())),
                completion_key: Set(Some(completion_key(
                    &enrollment.user_id,
                    enrollment.course_id,
                ))),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(enrollment::Column::Id.eq(enrollment.id))
            .filter(enrollment::Column::PaymentStatus.eq(EnrollmentStatus::Pending))
            .exec(&*self.db)
            .await;

        let updated = match updated {
            Ok(res) => res,
            Err(e) if is_unique_violation(&e) => {
                error!(
                    enrollment_id = %enrollment.id,
                    %gateway_order_id,
                    %gateway_payment_id,
                    "payment captured for a course the user is already enrolled in; refund required"
                );
                self.raise_refund(SettlementKind::Course, enrollment.id, gateway_payment_id)
                    .await;
                return Err(ServiceError::AlreadyEnrolled(format!(
                    "Already enrolled in course {}",
                    enrollment.course_id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if updated.rows_affected == 0 {
            return Ok(None);
        }

        let current = Enrollment::find_by_id(enrollment.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::UnknownOrder(gateway_order_id.to_string()))?;

        info!(enrollment_id = %current.id, course_id = %current.course_id, "enrollment completed");
        metrics::record_reconciliation("completed");
        self.event_sender
            .send_or_log(Event::EnrollmentCompleted {
                enrollment_id: current.id,
                course_id: current.course_id,
            })
            .await;

        Ok(Some(ReconciliationResult::enrollment(&current, false)))
    }

    /// Settles whichever record carries `gateway_order_id`. Used by webhooks,
    /// which do not say whether the payment was for a cart or a course.
    pub async fn settle_gateway_order(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<ReconciliationResult, ServiceError> {
        let is_order = Order::find()
            .filter(order::Column::GatewayOrderId.eq(gateway_order_id))
            .one(&*self.db)
            .await?
            .is_some();

        if is_order {
            self.mark_order_paid(gateway_order_id, gateway_payment_id)
                .await
        } else {
            self.complete_enrollment(gateway_order_id, gateway_payment_id)
                .await
        }
    }

    /// `pending -> failed` after the gateway reports a failed payment.
    #[instrument(skip(self))]
    pub async fn mark_failed(
        &self,
        gateway_order_id: &str,
    ) -> Result<ReconciliationResult, ServiceError> {
        if let Some(order) = Order::find()
            .filter(order::Column::GatewayOrderId.eq(gateway_order_id))
            .one(&*self.db)
            .await?
        {
            let updated = Order::update_many()
                .set(order::ActiveModel {
                    status: Set(OrderStatus::Failed),
                    updated_at: Set(Utc::now()),
                    ..Default::default()
                })
                .filter(order::Column::Id.eq(order.id))
                .filter(order::Column::Status.eq(OrderStatus::Pending))
                .exec(&*self.db)
                .await?;

            let current = self.current_order(order.id).await?;
            if updated.rows_affected == 0 {
                return Ok(ReconciliationResult::order(&current, true));
            }

            warn!(order_id = %order.id, %gateway_order_id, "order payment failed");
            metrics::record_reconciliation("failed");
            self.event_sender
                .send_or_log(Event::OrderPaymentFailed { order_id: order.id })
                .await;
            return Ok(ReconciliationResult::order(&current, false));
        }

        let enrollment = Enrollment::find()
            .filter(enrollment::Column::GatewayOrderId.eq(gateway_order_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::UnknownOrder(gateway_order_id.to_string()))?;

        let updated = Enrollment::update_many()
            .set(enrollment::ActiveModel {
                payment_status: Set(EnrollmentStatus::Failed),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(enrollment::Column::Id.eq(enrollment.id))
            .filter(enrollment::Column::PaymentStatus.eq(EnrollmentStatus::Pending))
            .exec(&*self.db)
            .await?;

        let current = Enrollment::find_by_id(enrollment.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::UnknownOrder(gateway_order_id.to_string()))?;
        if updated.rows_affected > 0 {
            warn!(enrollment_id = %enrollment.id, %gateway_order_id, "enrollment payment failed");
            metrics::record_reconciliation("failed");
        }
        Ok(ReconciliationResult::enrollment(
            &current,
            updated.rows_affected == 0,
        ))
    }

    /// Redirect flow: looks the session up at the gateway and enrolls the
    /// caller once it reports paid.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn confirm_session(
        &self,
        user_id: &str,
        gateway_session_id: &str,
    ) -> Result<ReconciliationResult, ServiceError> {
        let session = PaymentSession::find()
            .filter(payment_session::Column::GatewaySessionId.eq(gateway_session_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::UnknownOrder(gateway_session_id.to_string()))?;

        if session.user_id != user_id {
            warn!(payment_session_id = %session.id, "payment session confirmed by another user");
            return Err(ServiceError::Forbidden(
                "Payment session belongs to another user".into(),
            ));
        }

        if session.status == SessionStatus::Completed {
            return self.session_enrollment(&session).await;
        }

        let remote = self
            .gateway
            .retrieve_checkout_session(gateway_session_id)
            .await?;
        if !remote.is_paid() {
            metrics::record_reconciliation("unpaid");
            return Err(ServiceError::PaymentNotCompleted(format!(
                "Checkout session {} has not been paid",
                gateway_session_id
            )));
        }

        self.complete_session(session).await
    }

    /// `checkout.session.completed` webhook; the signature already vouched
    /// for the payload, so the gateway is not asked again.
    pub async fn complete_session_from_webhook(
        &self,
        gateway_session_id: &str,
    ) -> Result<ReconciliationResult, ServiceError> {
        let session = PaymentSession::find()
            .filter(payment_session::Column::GatewaySessionId.eq(gateway_session_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::UnknownOrder(gateway_session_id.to_string()))?;

        if session.status == SessionStatus::Completed {
            return self.session_enrollment(&session).await;
        }
        self.complete_session(session).await
    }

    async fn complete_session(
        &self,
        session: payment_session::Model,
    ) -> Result<ReconciliationResult, ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let updated = PaymentSession::update_many()
            .set(payment_session::ActiveModel {
                status: Set(SessionStatus::Completed),
                completed_at: Set(Some(now)),
                ..Default::default()
            })
            .filter(payment_session::Column::Id.eq(session.id))
            .filter(payment_session::Column::Status.eq(SessionStatus::Pending))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return self.session_enrollment(&session).await;
        }

        let savepoint = txn.begin().await?;
        let inserted = enrollment::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(session.user_id.clone()),
            course_id: Set(session.course_id),
            payment_status: Set(EnrollmentStatus::Completed),
            gateway_order_id: Set(None),
            gateway_payment_id: Set(Some(session.gateway_session_id.clone())),
            payment_session_id: Set(Some(session.id)),
            completion_key: Set(Some(completion_key(&session.user_id, session.course_id))),
            enrolled_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&savepoint)
        .await;

        let enrollment = match inserted {
            Ok(model) => {
                savepoint.commit().await?;
                Some(model)
            }
            Err(e) if is_unique_violation(&e) => {
                savepoint.rollback().await?;
                error!(
                    payment_session_id = %session.id,
                    course_id = %session.course_id,
                    "paid checkout session for a course the user is already enrolled in; refund required"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };
        txn.commit().await?;

        match enrollment {
            Some(enrollment) => {
                info!(enrollment_id = %enrollment.id, payment_session_id = %session.id, "enrollment completed from checkout session");
                metrics::record_reconciliation("completed");
                self.event_sender
                    .send_or_log(Event::EnrollmentCompleted {
                        enrollment_id: enrollment.id,
                        course_id: enrollment.course_id,
                    })
                    .await;
                Ok(ReconciliationResult::enrollment(&enrollment, false))
            }
            None => {
                metrics::record_reconciliation("duplicate_enrollment");
                self.session_enrollment(&session).await
            }
        }
    }

    /// The completed enrollment a finished session resolved to.
    async fn session_enrollment(
        &self,
        session: &payment_session::Model,
    ) -> Result<ReconciliationResult, ServiceError> {
        let enrollment = Enrollment::find()
            .filter(
                enrollment::Column::CompletionKey
                    .eq(completion_key(&session.user_id, session.course_id)),
            )
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::Internal(format!(
                    "completed payment session {} has no enrollment",
                    session.id
                ))
            })?;
        metrics::record_reconciliation("already_settled");
        Ok(ReconciliationResult::enrollment(&enrollment, true))
    }

    /// Verifies and dispatches a gateway webhook delivery.
    #[instrument(skip(self, headers, payload), fields(bytes = payload.len()))]
    pub async fn handle_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<WebhookAck, ServiceError> {
        if !verify_webhook_signature(
            headers,
            payload,
            self.gateway_config.webhook_secret(),
            self.gateway_config.webhook_tolerance_secs,
            Utc::now().timestamp(),
        ) {
            return Err(self.reject_signature("webhook", "-"));
        }

        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::Validation(format!("Malformed webhook payload: {}", e)))?;
        let event = body
            .get("event")
            .or_else(|| body.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let result = match event.as_str() {
            "payment.captured" | "order.paid" => {
                let payment = &body["payload"]["payment"]["entity"];
                let (Some(order_id), Some(payment_id)) = (
                    payment["order_id"].as_str(),
                    payment["id"].as_str(),
                ) else {
                    return Err(ServiceError::Validation(
                        "Webhook payment entity is missing order_id or id".into(),
                    ));
                };
                Some(self.settle_gateway_order(order_id, payment_id).await?)
            }
            "payment.failed" => {
                let Some(order_id) = body["payload"]["payment"]["entity"]["order_id"].as_str()
                else {
                    return Err(ServiceError::Validation(
                        "Webhook payment entity is missing order_id".into(),
                    ));
                };
                Some(self.mark_failed(order_id).await?)
            }
            "checkout.session.completed" => {
                let session = &body["data"]["object"];
                let Some(session_id) = session["id"].as_str() else {
                    return Err(ServiceError::Validation(
                        "Webhook session object is missing id".into(),
                    ));
                };
                if session["payment_status"].as_str() == Some("unpaid") {
                    debug!(session_id, "checkout session completed without payment");
                    None
                } else {
                    Some(self.complete_session_from_webhook(session_id).await?)
                }
            }
            other => {
                debug!(event = other, "ignoring webhook event");
                None
            }
        };

        Ok(WebhookAck {
            handled: result.is_some(),
            event,
            result,
        })
    }

    async fn current_order(&self, id: Uuid) -> Result<order::Model, ServiceError> {
        Order::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))
    }
}
