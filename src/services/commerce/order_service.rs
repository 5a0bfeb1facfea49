use crate::{
    entities::{
        enrollment, order, order_item, Course, Enrollment, EnrollmentStatus, Order, OrderItem,
        OrderStatus,
    },
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, LoaderTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    /// Price charged at checkout
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderItemView {
    fn from(item: order_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            variant_id: item.variant_id,
            quantity: item.quantity,
            unit_price: item.unit_price,
            line_total: item.line_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderView {
    pub id: Uuid,
    pub status: OrderStatus,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub coupon_id: Option<Uuid>,
    #[schema(value_type = Object)]
    pub shipping_address: serde_json::Value,
    pub shipping_method: String,
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub notes: Option<String>,
    pub items: Vec<OrderItemView>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl OrderView {
    fn new(order: order::Model, items: Vec<order_item::Model>) -> Self {
        Self {
            id: order.id,
            status: order.status,
            subtotal: order.subtotal,
            shipping_cost: order.shipping_cost,
            discount_amount: order.discount_amount,
            total_amount: order.total_amount,
            currency: order.currency,
            coupon_id: order.coupon_id,
            shipping_address: order.shipping_address,
            shipping_method: order.shipping_method,
            gateway_order_id: order.gateway_order_id,
            gateway_payment_id: order.gateway_payment_id,
            notes: order.notes,
            items: items.into_iter().map(OrderItemView::from).collect(),
            created_at: order.created_at,
            paid_at: order.paid_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnrollmentView {
    pub id: Uuid,
    pub course_id: Uuid,
    pub course_name: Option<String>,
    pub payment_status: EnrollmentStatus,
    pub gateway_order_id: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

/// Read side of settlement records plus administrator fulfilment moves.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// The user's orders with their frozen line items, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(&self, user_id: &str) -> Result<Vec<OrderView>, ServiceError> {
        let orders = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        let items = orders.load_many(OrderItem, &*self.db).await?;

        Ok(orders
            .into_iter()
            .zip(items)
            .map(|(order, items)| OrderView::new(order, items))
            .collect())
    }

    pub async fn get_order(&self, user_id: &str, id: Uuid) -> Result<OrderView, ServiceError> {
        let order = Order::find_by_id(id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
        self.with_items(order).await
    }

    #[instrument(skip(self))]
    pub async fn list_enrollments(
        &self,
        user_id: &str,
    ) -> Result<Vec<EnrollmentView>, ServiceError> {
        let enrollments = Enrollment::find()
            .filter(enrollment::Column::UserId.eq(user_id))
            .order_by_desc(enrollment::Column::EnrolledAt)
            .all(&*self.db)
            .await?;

        let course_ids: Vec<Uuid> = enrollments.iter().map(|e| e.course_id).collect();
        let names: HashMap<Uuid, String> = Course::find()
            .filter(crate::entities::course::Column::Id.is_in(course_ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();

        Ok(enrollments
            .into_iter()
            .map(|e| EnrollmentView {
                id: e.id,
                course_id: e.course_id,
                course_name: names.get(&e.course_id).cloned(),
                payment_status: e.payment_status,
                gateway_order_id: e.gateway_order_id,
                enrolled_at: e.enrolled_at,
            })
            .collect())
    }

    /// Applies a fulfilment move. Payment states are owned by reconciliation
    /// and cannot be set here.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: Uuid,
        next: OrderStatus,
    ) -> Result<OrderView, ServiceError> {
        let order = Order::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;

        if !order.status.can_transition_to(next) {
            return Err(ServiceError::InvalidStatusTransition {
                from: order.status,
                to: next,
            });
        }

        let updated = Order::update_many()
            .set(order::ActiveModel {
                status: Set(next),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(order.status))
            .exec(&*self.db)
            .await?;

        let current = Order::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::InvalidStatusTransition {
                from: current.status,
                to: next,
            });
        }

        info!(order_id = %id, from = %order.status, to = %next, "order status updated");
        self.with_items(current).await
    }

    async fn with_items(&self, order: order::Model) -> Result<OrderView, ServiceError> {
        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;
        Ok(OrderView::new(order, items))
    }
}
