//! Creates the podcasts table. A podcast owns items and points at the storage
//! key of its most recently published feed manifest.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Podcasts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Podcasts::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Podcasts::UserId).uuid().not_null())
                    .col(ColumnDef::new(Podcasts::Title).text().not_null())
                    .col(ColumnDef::new(Podcasts::Description).text().null())
                    .col(ColumnDef::new(Podcasts::FeedKey).text().null())
                    .col(
                        ColumnDef::new(Podcasts::FeedUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Podcasts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Podcasts::UpdatedAt)
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
                    .name("idx_podcasts_user_id")
                    .table(Podcasts::Table)
                    .col(Podcasts::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_podcasts_user_id").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Podcasts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Podcasts {
    Table,
    Id,
    UserId,
    Title,
    Description,
    FeedKey,
    FeedUpdatedAt,
    CreatedAt,
    UpdatedAt,
}
