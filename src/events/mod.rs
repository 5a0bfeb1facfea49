use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// What kind of record a settlement produced.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "snake_case")]
pub enum SettlementKind {
    Cart,
    Course,
}

/// Domain events emitted by the settlement pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    SettlementCreated {
        kind: SettlementKind,
        record_id: Uuid,
        gateway_reference: Option<String>,
        amount: Decimal,
    },
    OrderPaid {
        order_id: Uuid,
        gateway_payment_id: String,
    },
    OrderPaymentFailed {
        order_id: Uuid,
    },
    EnrollmentCompleted {
        enrollment_id: Uuid,
        course_id: Uuid,
    },
    CouponRedeemed {
        coupon_id: Uuid,
        order_id: Uuid,
    },
    /// A verified payment landed on a record that can no longer take it.
    RefundRequired {
        kind: SettlementKind,
        record_id: Uuid,
        gateway_payment_id: String,
    },
    /// The coupon could not be redeemed at payment time; the order stays paid.
    CouponRedemptionRejected {
        coupon_id: Uuid,
        order_id: Uuid,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    /// Settlement state is already committed by the time events go out.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping settlement event");
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CouponRedemptionRejected {
                coupon_id,
                order_id,
                reason,
            } => {
                warn!(%coupon_id, %order_id, %reason, "coupon redemption rejected after payment");
            }
            Event::RefundRequired {
                kind,
                record_id,
                gateway_payment_id,
            } => {
                error!(%kind, %record_id, %gateway_payment_id, "refund required");
            }
            Event::OrderPaymentFailed { order_id } => {
                warn!(%order_id, "order payment failed");
            }
            other => info!(event = ?other, "settlement event"),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();

        sender.send(Event::OrderPaymentFailed { order_id }).await.unwrap();

        assert_matches!(rx.recv().await, Some(Event::OrderPaymentFailed { order_id: id }) if id == order_id);
    }

    #[tokio::test]
    async fn send_or_log_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        assert!(sender
            .send(Event::OrderPaymentFailed {
                order_id: Uuid::new_v4()
            })
            .await
            .is_err());
        sender
            .send_or_log(Event::OrderPaymentFailed {
                order_id: Uuid::new_v4(),
            })
            .await;
    }
}
