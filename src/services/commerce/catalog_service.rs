use crate::{
    entities::{course, product, product_variant, Course, Product, ProductVariant},
    errors::ServiceError,
};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// A cart line as the client sends it. Never carries a price.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct LineItem {
    pub product_id: Uuid,
    #[serde(default)]
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

/// A cart line priced from the catalog at settlement time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ResolvedLineItem {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub available_stock: i32,
}

impl ResolvedLineItem {
    pub fn line_total(&self) -> Decimal {
        (self.unit_price * Decimal::from(self.quantity)).round_dp(2)
    }
}

/// Current fee of a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ResolvedCourse {
    pub course_id: Uuid,
    pub name: String,
    pub fee: Decimal,
    pub is_free: bool,
}

/// Read-only price and stock oracle over the catalog tables.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Prices every line from the catalog, in request order.
    ///
    /// Quantities requesting the same product/variant are summed before the
    /// stock check so a cart cannot split one item across lines to get past it.
    #[instrument(skip(self, items), fields(lines = items.len()))]
    pub async fn resolve_line_items(
        &self,
        items: &[LineItem],
    ) -> Result<Vec<ResolvedLineItem>, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::Validation("Cart is empty".to_string()));
        }
        for item in items {
            item.validate()?;
        }

        let product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let variant_ids: Vec<Uuid> = items.iter().filter_map(|i| i.variant_id).collect();

        let products: HashMap<Uuid, product::Model> = Product::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let variants: HashMap<Uuid, product_variant::Model> = if variant_ids.is_empty() {
            HashMap::new()
        } else {
            ProductVariant::find()
                .filter(product_variant::Column::Id.is_in(variant_ids))
                .all(&*self.db)
                .await?
                .into_iter()
                .map(|v| (v.id, v))
                .collect()
        };

        let mut requested: HashMap<(Uuid, Option<Uuid>), i32> = HashMap::new();
        for item in items {
            *requested
                .entry((item.product_id, item.variant_id))
                .or_insert(0) += item.quantity;
        }

        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            let product = products
                .get(&item.product_id)
                .filter(|p| p.is_active)
                .ok_or_else(|| {
                    ServiceError::Unavailable(format!("Product {} is not available", item.product_id))
                })?;

            let (name, unit_price, stock) = match item.variant_id {
                Some(variant_id) => {
                    let variant = variants
                        .get(&variant_id)
                        .filter(|v| v.product_id == product.id)
                        .ok_or_else(|| {
                            ServiceError::Unavailable(format!(
                                "Variant {} is not available",
                                variant_id
                            ))
                        })?;
                    (
                        format!("{} ({})", product.name, variant.name),
                        variant.price.unwrap_or(product.price),
                        variant.stock,
                    )
                }
                None => (product.name.clone(), product.price, product.stock),
            };

            let wanted = requested
                .get(&(item.product_id, item.variant_id))
                .copied()
                .unwrap_or(item.quantity);
            if wanted > stock {
                return Err(ServiceError::InsufficientStock(format!(
                    "Only {} of {} left in stock",
                    stock.max(0),
                    name
                )));
            }

            resolved.push(ResolvedLineItem {
                product_id: item.product_id,
                variant_id: item.variant_id,
                name,
                quantity: item.quantity,
                unit_price: unit_price.round_dp(2),
                available_stock: stock,
            });
        }

        debug!(resolved = resolved.len(), "line items priced from catalog");
        Ok(resolved)
    }

    /// Current fee of a published course. Free courses report a zero fee.
    #[instrument(skip(self))]
    pub async fn resolve_course(&self, course_id: Uuid) -> Result<ResolvedCourse, ServiceError> {
        let course: course::Model = Course::find_by_id(course_id)
            .one(&*self.db)
            .await?
            .filter(|c| c.is_published)
            .ok_or_else(|| ServiceError::Unavailable(format!("Course {} not found", course_id)))?;

        let is_free = course.is_free || course.price <= Decimal::ZERO;
        Ok(ResolvedCourse {
            course_id: course.id,
            name: course.name,
            fee: if is_free {
                Decimal::ZERO
            } else {
                course.price.round_dp(2)
            },
            is_free,
        })
    }
}
