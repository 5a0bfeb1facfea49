use sea_orm_migration::prelude::*;

use super::m20260101_000001_create_catalog_tables::Courses;

/// Enrollments and redirect-flow payment sessions.
///
/// `enrollments.completion_key` is only populated once an enrollment reaches
/// `completed`; its unique index is what guarantees a single completed
/// enrollment per (user, course) while pending and failed attempts coexist.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PaymentSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PaymentSessions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PaymentSessions::GatewaySessionId)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(PaymentSessions::UserId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(PaymentSessions::CourseId).uuid().not_null())
                    .col(
                        ColumnDef::new(PaymentSessions::Amount)
                            .decimal_len(12, 2)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PaymentSessions::Currency)
                            .string_len(3)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PaymentSessions::Status)
                            .string_len(32)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(PaymentSessions::CheckoutUrl).text().null())
                    .col(
                        ColumnDef::new(PaymentSessions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PaymentSessions::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_payment_sessions_course_id")
                            .from(PaymentSessions::Table, PaymentSessions::CourseId)
                            .to(Courses::Table, Courses::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Enrollments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Enrollments::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Enrollments::UserId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Enrollments::CourseId).uuid().not_null())
                    .col(
                        ColumnDef::new(Enrollments::PaymentStatus)
                            .string_len(32)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Enrollments::GatewayOrderId)
                            .string_len(255)
                            .null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Enrollments::GatewayPaymentId)
                            .string_len(255)
                            .null(),
                    )
                    .col(ColumnDef::new(Enrollments::PaymentSessionId).uuid().null())
                    .col(
                        ColumnDef::new(Enrollments::CompletionKey)
                            .string_len(320)
                            .null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Enrollments::EnrolledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Enrollments::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_enrollments_course_id")
                            .from(Enrollments::Table, Enrollments::CourseId)
                            .to(Courses::Table, Courses::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_enrollments_payment_session_id")
                            .from(Enrollments::Table, Enrollments::PaymentSessionId)
                            .to(PaymentSessions::Table, PaymentSessions::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_enrollments_user_course")
                    .table(Enrollments::Table)
                    .col(Enrollments::UserId)
                    .col(Enrollments::CourseId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Enrollments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PaymentSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PaymentSessions {
    Table,
    Id,
    GatewaySessionId,
    UserId,
    CourseId,
    Amount,
    Currency,
    Status,
    CheckoutUrl,
    CreatedAt,
    CompletedAt,
}

#[derive(DeriveIden)]
enum Enrollments {
    Table,
    Id,
    UserId,
    CourseId,
    PaymentStatus,
    GatewayOrderId,
    GatewayPaymentId,
    PaymentSessionId,
    CompletionKey,
    EnrolledAt,
    UpdatedAt,
}
