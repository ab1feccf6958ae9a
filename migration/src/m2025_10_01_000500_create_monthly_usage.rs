//! Creates the monthly_usage ledger: bytes consumed per user per billing cycle.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MonthlyUsage::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MonthlyUsage::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MonthlyUsage::UserId).uuid().not_null())
                    .col(
                        ColumnDef::new(MonthlyUsage::UsageBytes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(MonthlyUsage::LimitBytes)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MonthlyUsage::BillingCycleStart)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MonthlyUsage::BillingCycleEnd)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MonthlyUsage::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(MonthlyUsage::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_monthly_usage_user_cycle_end")
                    .table(MonthlyUsage::Table)
                    .col(MonthlyUsage::UserId)
                    .col(MonthlyUsage::BillingCycleEnd)
                    .to_owned(),
            )
            .await?;

        // One ledger per user and cycle start; concurrent rollovers collide here.
        manager
            .create_index(
                Index::create()
                    .name("idx_monthly_usage_user_cycle_start")
                    .table(MonthlyUsage::Table)
                    .col(MonthlyUsage::UserId)
                    .col(MonthlyUsage::BillingCycleStart)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_monthly_usage_user_cycle_start")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_monthly_usage_user_cycle_end")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(MonthlyUsage::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MonthlyUsage {
    Table,
    Id,
    UserId,
    UsageBytes,
    LimitBytes,
    BillingCycleStart,
    BillingCycleEnd,
    CreatedAt,
    UpdatedAt,
}
