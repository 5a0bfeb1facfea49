use sea_orm_migration::prelude::*;

/// Coupons plus their redemption ledger.
///
/// `coupon_usages` carries two sequence columns so that the usage limits are
/// enforced by unique indexes rather than by a read-then-insert check:
/// `global_seq` is the n-th redemption of the coupon and `user_seq` the n-th
/// redemption by one user. Two concurrent redemptions computing the same
/// slot collide on the index and only one commits.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Coupons::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Coupons::Id).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(Coupons::Code)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Coupons::DiscountType)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Coupons::DiscountValue)
                            .decimal_len(12, 2)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Coupons::MinCartValue).decimal_len(12, 2).null())
                    .col(ColumnDef::new(Coupons::MaxDiscount).decimal_len(12, 2).null())
                    .col(
                        ColumnDef::new(Coupons::StartDate)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Coupons::EndDate)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Coupons::UsageLimit).integer().null())
                    .col(ColumnDef::new(Coupons::UsageLimitPerUser).integer().null())
                    .col(
                        ColumnDef::new(Coupons::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Coupons::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Coupons::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CouponUsages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CouponUsages::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CouponUsages::CouponId).uuid().not_null())
                    .col(
                        ColumnDef::new(CouponUsages::UserId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(CouponUsages::OrderId).uuid().not_null())
                    .col(ColumnDef::new(CouponUsages::GlobalSeq).integer().not_null())
                    .col(ColumnDef::new(CouponUsages::UserSeq).integer().not_null())
                    .col(
                        ColumnDef::new(CouponUsages::UsedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_coupon_usages_coupon_id")
                            .from(CouponUsages::Table, CouponUsages::CouponId)
                            .to(Coupons::Table, Coupons::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_coupon_usages_coupon_order")
                    .table(CouponUsages::Table)
                    .col(CouponUsages::CouponId)
                    .col(CouponUsages::OrderId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_coupon_usages_global_seq")
                    .table(CouponUsages::Table)
                    .col(CouponUsages::CouponId)
                    .col(CouponUsages::GlobalSeq)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_coupon_usages_user_seq")
                    .table(CouponUsages::Table)
                    .col(CouponUsages::CouponId)
                    .col(CouponUsages::UserId)
                    .col(CouponUsages::UserSeq)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CouponUsages::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Coupons::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Coupons {
    Table,
    Id,
    Code,
    DiscountType,
    DiscountValue,
    MinCartValue,
    MaxDiscount,
    StartDate,
    EndDate,
    UsageLimit,
    UsageLimitPerUser,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum CouponUsages {
    Table,
    Id,
    CouponId,
    UserId,
    OrderId,
    GlobalSeq,
    UserSeq,
    UsedAt,
}
