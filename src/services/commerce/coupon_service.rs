use crate::{
    db::is_unique_violation,
    entities::{coupon, coupon_usage, Coupon, CouponUsage, DiscountType},
    errors::ServiceError,
    metrics,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::pricing_service::money;

/// Attempts at claiming a usage slot before giving up on a contended coupon.
const MAX_REDEEM_ATTEMPTS: usize = 5;

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectionReason {
    Invalid,
    NotYetActive,
    Expired,
    BelowMinimum,
    LimitExceeded,
    AlreadyUsed,
}

/// Why a coupon does not apply, with a message fit to show the shopper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CouponRejection {
    pub reason: RejectionReason,
    pub message: String,
}

impl CouponRejection {
    pub fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    fn invalid() -> Self {
        Self::new(RejectionReason::Invalid, "Invalid coupon code")
    }
}

/// Outcome of a speculative evaluation. Nothing is written.
#[derive(Debug, Clone, PartialEq)]
pub enum EligibilityResult {
    Eligible {
        coupon: coupon::Model,
        discount: Decimal,
    },
    Rejected(CouponRejection),
}

impl EligibilityResult {
    /// Turns a rejection into the error that aborts a settlement.
    pub fn into_discount(self) -> Result<(coupon::Model, Decimal), ServiceError> {
        match self {
            EligibilityResult::Eligible { coupon, discount } => Ok((coupon, discount)),
            EligibilityResult::Rejected(rejection) => Err(ServiceError::Coupon(rejection)),
        }
    }
}

/// Outcome of recording a usage row once payment is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub enum RedemptionOutcome {
    Redeemed(coupon_usage::Model),
    /// A usage row for this order already exists.
    AlreadyRecorded,
    Rejected(CouponRejection),
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Discount for `subtotal`, capped for percentage coupons and never above
/// the subtotal itself.
pub fn compute_discount(coupon: &coupon::Model, subtotal: Decimal) -> Decimal {
    let raw = match coupon.discount_type {
        DiscountType::Percentage => {
            let pct = subtotal * coupon.discount_value / Decimal::ONE_HUNDRED;
            match coupon.max_discount {
                Some(cap) if pct > cap => cap,
                _ => pct,
            }
        }
        DiscountType::Fixed => coupon.discount_value,
    };
    money(raw.min(subtotal).max(Decimal::ZERO))
}

/// Applies the eligibility rules, in order, to an already looked-up coupon.
pub fn assess(
    coupon: &coupon::Model,
    now: DateTime<Utc>,
    subtotal: Decimal,
    times_used: u64,
    times_used_by_user: u64,
) -> Result<Decimal, CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::invalid());
    }
    if coupon.start_date.is_some_and(|start| now < start) {
        return Err(CouponRejection::new(
            RejectionReason::NotYetActive,
            "Coupon is not yet active",
        ));
    }
    if coupon.end_date.is_some_and(|end| now > end) {
        return Err(CouponRejection::new(
            RejectionReason::Expired,
            "Coupon has expired",
        ));
    }
    if let Some(min) = coupon.min_cart_value {
        if subtotal < min {
            return Err(CouponRejection::new(
                RejectionReason::BelowMinimum,
                format!("Minimum cart value of {:.2} required", min),
            ));
        }
    }
    if let Some(limit) = coupon.usage_limit {
        if times_used >= limit.max(0) as u64 {
            return Err(CouponRejection::new(
                RejectionReason::LimitExceeded,
                "Coupon usage limit exceeded",
            ));
        }
    }
    if let Some(limit) = coupon.usage_limit_per_user {
        if times_used_by_user >= limit.max(0) as u64 {
            return Err(CouponRejection::new(
                RejectionReason::AlreadyUsed,
                "You have already used this coupon",
            ));
        }
    }

    Ok(compute_discount(coupon, subtotal))
}

async fn usage_counts<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    user_id: &str,
) -> Result<(u64, u64), sea_orm::DbErr> {
    let global = CouponUsage::find()
        .filter(coupon_usage::Column::CouponId.eq(coupon_id))
        .count(conn)
        .await?;
    let per_user = CouponUsage::find()
        .filter(coupon_usage::Column::CouponId.eq(coupon_id))
        .filter(coupon_usage::Column::UserId.eq(user_id))
        .count(conn)
        .await?;
    Ok((global, per_user))
}

/// Inserts the usage row for the slot after `counts` under a savepoint.
/// `None` when another redemption already holds that slot.
async fn claim_slot(
    txn: &DatabaseTransaction,
    coupon_id: Uuid,
    user_id: &str,
    order_id: Uuid,
    (global, per_user): (u64, u64),
    now: DateTime<Utc>,
) -> Result<Option<coupon_usage::Model>, ServiceError> {
    let savepoint = txn.begin().await?;
    let usage = coupon_usage::ActiveModel {
        id: Set(Uuid::new_v4()),
        coupon_id: Set(coupon_id),
        user_id: Set(user_id.to_string()),
        order_id: Set(order_id),
        global_seq: Set(global as i32 + 1),
        user_seq: Set(per_user as i32 + 1),
        used_at: Set(now),
    };

    match usage.insert(&savepoint).await {
        Ok(model) => {
            savepoint.commit().await?;
            Ok(Some(model))
        }
        Err(err) if is_unique_violation(&err) => {
            savepoint.rollback().await?;
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Claims the next usage slot for `(coupon, user)` inside `txn`.
///
/// Limits are re-checked against committed rows and the slot numbers are
/// guarded by unique indexes, so two payments racing for the last slot
/// cannot both insert. A losing insert rolls back its savepoint and retries
/// against the new counts.
#[instrument(skip(txn))]
pub async fn redeem(
    txn: &DatabaseTransaction,
    coupon_id: Uuid,
    user_id: &str,
    order_id: Uuid,
    now: DateTime<Utc>,
) -> Result<RedemptionOutcome, ServiceError> {
    let existing = CouponUsage::find()
        .filter(coupon_usage::Column::CouponId.eq(coupon_id))
        .filter(coupon_usage::Column::OrderId.eq(order_id))
        .one(txn)
        .await?;
    if existing.is_some() {
        return Ok(RedemptionOutcome::AlreadyRecorded);
    }

    let Some(coupon) = Coupon::find_by_id(coupon_id).one(txn).await? else {
        return Ok(RedemptionOutcome::Rejected(CouponRejection::invalid()));
    };

    for attempt in 1..=MAX_REDEEM_ATTEMPTS {
        let counts = usage_counts(txn, coupon.id, user_id).await?;
        let (global, per_user) = counts;

        if let Some(limit) = coupon.usage_limit {
            if global >= limit.max(0) as u64 {
                return Ok(RedemptionOutcome::Rejected(CouponRejection::new(
                    RejectionReason::LimitExceeded,
                    "Coupon usage limit exceeded",
                )));
            }
        }
        if let Some(limit) = coupon.usage_limit_per_user {
            if per_user >= limit.max(0) as u64 {
                return Ok(RedemptionOutcome::Rejected(CouponRejection::new(
                    RejectionReason::AlreadyUsed,
                    "You have already used this coupon",
                )));
            }
        }

        match claim_slot(txn, coupon.id, user_id, order_id, counts, now).await? {
            Some(model) => {
                debug!(usage_id = %model.id, global_seq = model.global_seq, "coupon usage recorded");
                return Ok(RedemptionOutcome::Redeemed(model));
            }
            None => debug!(attempt, "coupon usage slot taken concurrently, retrying"),
        }
    }

    warn!(%coupon_id, %order_id, "coupon redemption still contended after retries");
    Err(ServiceError::Storage(format!(
        "could not claim a usage slot for coupon {}",
        coupon_id
    )))
}

fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

fn validate_non_negative_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value >= Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must not be negative".into());
        Err(err)
    }
}

fn default_true() -> bool {
    true
}

/// Administrator input for creating or replacing a coupon.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CouponInput {
    #[validate(length(min = 3, max = 64))]
    pub code: String,
    pub discount_type: DiscountType,
    #[validate(custom = "validate_positive_decimal")]
    pub discount_value: Decimal,
    #[validate(custom = "validate_non_negative_decimal")]
    pub min_cart_value: Option<Decimal>,
    #[validate(custom = "validate_positive_decimal")]
    pub max_discount: Option<Decimal>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    #[validate(range(min = 1))]
    pub usage_limit_per_user: Option<i32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl CouponInput {
    fn check(&self) -> Result<(), ServiceError> {
        self.validate()?;
        if normalize_code(&self.code).is_empty() {
            return Err(ServiceError::Validation("Coupon code is required".into()));
        }
        if self.discount_type == DiscountType::Percentage
            && self.discount_value > Decimal::ONE_HUNDRED
        {
            return Err(ServiceError::Validation(
                "Percentage discount cannot exceed 100".into(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end <= start {
                return Err(ServiceError::Validation(
                    "end_date must be after start_date".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Coupon as administrators see it, with how often it has been redeemed.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CouponView {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub min_cart_value: Option<Decimal>,
    pub max_discount: Option<Decimal>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub usage_limit: Option<i32>,
    pub usage_limit_per_user: Option<i32>,
    pub is_active: bool,
    pub times_used: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CouponView {
    fn new(model: coupon::Model, times_used: u64) -> Self {
        Self {
            id: model.id,
            code: model.code,
            discount_type: model.discount_type,
            discount_value: model.discount_value,
            min_cart_value: model.min_cart_value,
            max_discount: model.max_discount,
            start_date: model.start_date,
            end_date: model.end_date,
            usage_limit: model.usage_limit,
            usage_limit_per_user: model.usage_limit_per_user,
            is_active: model.is_active,
            times_used,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

/// Coupon eligibility and administration.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Decides whether `code` applies to `user_id`'s cart of `subtotal` and
    /// what it takes off. Safe to call speculatively.
    #[instrument(skip(self))]
    pub async fn evaluate(
        &self,
        code: &str,
        user_id: &str,
        subtotal: Decimal,
    ) -> Result<EligibilityResult, ServiceError> {
        let result = self.evaluate_at(code, user_id, subtotal, Utc::now()).await?;
        match &result {
            EligibilityResult::Eligible { coupon, discount } => {
                metrics::record_coupon_evaluation("eligible");
                debug!(coupon_id = %coupon.id, %discount, "coupon eligible");
            }
            EligibilityResult::Rejected(rejection) => {
                metrics::record_coupon_evaluation(rejection.reason.as_ref());
                debug!(reason = %rejection.reason, "coupon rejected");
            }
        }
        Ok(result)
    }

    pub async fn evaluate_at(
        &self,
        code: &str,
        user_id: &str,
        subtotal: Decimal,
        now: DateTime<Utc>,
    ) -> Result<EligibilityResult, ServiceError> {
        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Ok(EligibilityResult::Rejected(CouponRejection::invalid()));
        }

        let Some(coupon) = Coupon::find()
            .filter(coupon::Column::Code.eq(normalized))
            .filter(coupon::Column::IsActive.eq(true))
            .one(&*self.db)
            .await?
        else {
            return Ok(EligibilityResult::Rejected(CouponRejection::invalid()));
        };

        let (global, per_user) = if coupon.usage_limit.is_some()
            || coupon.usage_limit_per_user.is_some()
        {
            usage_counts(&*self.db, coupon.id, user_id).await?
        } else {
            (0, 0)
        };

        Ok(match assess(&coupon, now, subtotal, global, per_user) {
            Ok(discount) => EligibilityResult::Eligible { coupon, discount },
            Err(rejection) => EligibilityResult::Rejected(rejection),
        })
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_coupon(&self, input: CouponInput) -> Result<CouponView, ServiceError> {
        input.check()?;
        let now = Utc::now();

        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(normalize_code(&input.code)),
            discount_type: Set(input.discount_type),
            discount_value: Set(money(input.discount_value)),
            min_cart_value: Set(input.min_cart_value.map(money)),
            max_discount: Set(input.max_discount.map(money)),
            start_date: Set(input.start_date),
            end_date: Set(input.end_date),
            usage_limit: Set(input.usage_limit),
            usage_limit_per_user: Set(input.usage_limit_per_user),
            is_active: Set(input.is_active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(duplicate_code)?;

        info!(coupon_id = %model.id, code = %model.code, "coupon created");
        Ok(CouponView::new(model, 0))
    }

    /// Replaces every editable field of a coupon.
    #[instrument(skip(self, input))]
    pub async fn update_coupon(
        &self,
        id: Uuid,
        input: CouponInput,
    ) -> Result<CouponView, ServiceError> {
        input.check()?;
        let existing = self.find(id).await?;

        let mut active: coupon::ActiveModel = existing.into();
        active.code = Set(normalize_code(&input.code));
        active.discount_type = Set(input.discount_type);
        active.discount_value = Set(money(input.discount_value));
        active.min_cart_value = Set(input.min_cart_value.map(money));
        active.max_discount = Set(input.max_discount.map(money));
        active.start_date = Set(input.start_date);
        active.end_date = Set(input.end_date);
        active.usage_limit = Set(input.usage_limit);
        active.usage_limit_per_user = Set(input.usage_limit_per_user);
        active.is_active = Set(input.is_active);
        active.updated_at = Set(Utc::now());

        let model = active.update(&*self.db).await.map_err(duplicate_code)?;
        let times_used = self.times_used(model.id).await?;
        info!(coupon_id = %model.id, "coupon updated");
        Ok(CouponView::new(model, times_used))
    }

    pub async fn list_coupons(&self) -> Result<Vec<CouponView>, ServiceError> {
        let coupons = Coupon::find()
            .order_by_desc(coupon::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        let mut views = Vec::with_capacity(coupons.len());
        for model in coupons {
            let times_used = self.times_used(model.id).await?;
            views.push(CouponView::new(model, times_used));
        }
        Ok(views)
    }

    /// Coupons are switched off rather than deleted; usage rows point at them.
    #[instrument(skip(self))]
    pub async fn deactivate_coupon(&self, id: Uuid) -> Result<CouponView, ServiceError> {
        let existing = self.find(id).await?;
        let mut active: coupon::ActiveModel = existing.into();
        active.is_active = Set(false);
        active.updated_at = Set(Utc::now());
        let model = active.update(&*self.db).await?;

        let times_used = self.times_used(model.id).await?;
        info!(coupon_id = %model.id, "coupon deactivated");
        Ok(CouponView::new(model, times_used))
    }

    async fn find(&self, id: Uuid) -> Result<coupon::Model, ServiceError> {
        Coupon::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", id)))
    }

    async fn times_used(&self, coupon_id: Uuid) -> Result<u64, ServiceError> {
        Ok(CouponUsage::find()
            .filter(coupon_usage::Column::CouponId.eq(coupon_id))
            .count(&*self.db)
            .await?)
    }
}

fn duplicate_code(err: sea_orm::DbErr) -> ServiceError {
    if is_unique_violation(&err) {
        ServiceError::Validation("A coupon with this code already exists".into())
    } else {
        ServiceError::DatabaseError(err)
    }
}
