use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    /// Whether a verified capture may still settle the order.
    pub fn accepts_capture(self) -> bool {
        self == OrderStatus::Pending
    }

    /// Payment can no longer settle the order and nothing was ever captured
    /// for it.
    pub fn is_closed_unpaid(self) -> bool {
        matches!(self, OrderStatus::Failed | OrderStatus::Cancelled)
    }

    /// Fulfilment moves an administrator may apply. `paid` and `failed` are
    /// reserved for payment reconciliation.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Cancelled)
                | (OrderStatus::Paid, OrderStatus::Shipped)
                | (OrderStatus::Shipped, OrderStatus::Delivered)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: String,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub shipping_cost: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub discount_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub total_amount: Decimal,
    pub currency: String,
    pub coupon_id: Option<Uuid>,
    pub status: OrderStatus,
    /// Snapshot taken at checkout; never re-read from a profile.
    #[sea_orm(column_type = "Json")]
    pub shipping_address: Json,
    pub shipping_method: String,
    #[sea_orm(unique)]
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(
        belongs_to = "super::coupon::Entity",
        from = "Column::CouponId",
        to = "super::coupon::Column::Id"
    )]
    Coupon,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::coupon::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Coupon.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulfilment_transitions_follow_the_lifecycle() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Shipped));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));

        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Paid));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Shipped));
        assert!(!OrderStatus::Failed.can_transition_to(OrderStatus::Paid));
    }

    #[test]
    fn only_pending_orders_take_a_capture() {
        assert!(OrderStatus::Pending.accepts_capture());
        assert!(!OrderStatus::Failed.accepts_capture());
        assert!(!OrderStatus::Paid.accepts_capture());
        assert!(!OrderStatus::Cancelled.accepts_capture());

        assert!(OrderStatus::Failed.is_closed_unpaid());
        assert!(OrderStatus::Cancelled.is_closed_unpaid());
        assert!(!OrderStatus::Delivered.is_closed_unpaid());
    }

    #[test]
    fn status_displays_as_stored() {
        assert_eq!(OrderStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(OrderStatus::Paid.to_string(), "paid");
    }
}
