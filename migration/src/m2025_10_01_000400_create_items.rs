//! Creates the items table (podcast episodes awaiting or holding audio).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Items::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Items::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Items::UserId).uuid().not_null())
                    .col(ColumnDef::new(Items::PodcastId).uuid().not_null())
                    .col(ColumnDef::new(Items::Url).text().not_null())
                    .col(
                        ColumnDef::new(Items::Status)
                            .text()
                            .not_null()
                            .default("CREATED"),
                    )
                    .col(ColumnDef::new(Items::Title).text().null())
                    .col(ColumnDef::new(Items::Error).text().null())
                    .col(ColumnDef::new(Items::DownloadId).uuid().null())
                    .col(
                        ColumnDef::new(Items::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Items::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Feed regeneration lists a podcast's items in creation order
        manager
            .create_index(
                Index::create()
                    .name("idx_items_podcast_created")
                    .table(Items::Table)
                    .col(Items::PodcastId)
                    .col(Items::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_items_podcast_created").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Items::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Items {
    Table,
    Id,
    UserId,
    PodcastId,
    Url,
    Status,
    Title,
    Error,
    DownloadId,
    CreatedAt,
    UpdatedAt,
}
