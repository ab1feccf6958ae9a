//! Migration to create the queue_entries table.
//!
//! A queue entry is the durable unit of background work. It references its
//! target record polymorphically (`target_collection` + `target_id`), so no
//! foreign key is declared.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QueueEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QueueEntries::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(QueueEntries::TargetId).uuid().not_null())
                    .col(
                        ColumnDef::new(QueueEntries::TargetCollection)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::Status)
                            .text()
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(ColumnDef::new(QueueEntries::WorkerId).text().null())
                    .col(
                        ColumnDef::new(QueueEntries::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::MaxRetries)
                            .integer()
                            .not_null()
                            .default(6),
                    )
                    .col(ColumnDef::new(QueueEntries::LastError).text().null())
                    .col(ColumnDef::new(QueueEntries::LastProxy).text().null())
                    .col(
                        ColumnDef::new(QueueEntries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Dispatcher scans pending entries oldest-first
        manager
            .create_index(
                Index::create()
                    .name("idx_queue_entries_status_updated")
                    .table(QueueEntries::Table)
                    .col(QueueEntries::Status)
                    .col(QueueEntries::UpdatedAt)
                    .col(QueueEntries::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_queue_entries_target")
                    .table(QueueEntries::Table)
                    .col(QueueEntries::TargetCollection)
                    .col(QueueEntries::TargetId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_queue_entries_status_updated")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(Index::drop().name("idx_queue_entries_target").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(QueueEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QueueEntries {
    Table,
    Id,
    TargetId,
    TargetCollection,
    Status,
    WorkerId,
    RetryCount,
    MaxRetries,
    LastError,
    LastProxy,
    CreatedAt,
    UpdatedAt,
}
