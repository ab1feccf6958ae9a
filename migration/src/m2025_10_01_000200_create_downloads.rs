//! Creates the downloads table.
//!
//! One row exists per remote content id; the unique index is what lets
//! concurrent workers converge on a single stored file for the same video.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Downloads::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Downloads::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Downloads::ContentId).text().not_null())
                    .col(ColumnDef::new(Downloads::Title).text().not_null())
                    .col(ColumnDef::new(Downloads::Channel).text().null())
                    .col(ColumnDef::new(Downloads::Description).text().null())
                    .col(ColumnDef::new(Downloads::DurationSeconds).double().null())
                    .col(
                        ColumnDef::new(Downloads::SizeBytes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Downloads::FileKey).text().not_null())
                    .col(
                        ColumnDef::new(Downloads::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Downloads::UpdatedAt)
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
                    .name("idx_downloads_content_id")
                    .table(Downloads::Table)
                    .col(Downloads::ContentId)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_downloads_content_id").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Downloads::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Downloads {
    Table,
    Id,
    ContentId,
    Title,
    Channel,
    Description,
    DurationSeconds,
    SizeBytes,
    FileKey,
    CreatedAt,
    UpdatedAt,
}
