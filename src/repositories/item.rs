//! # Item Repository

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::models::download;
use crate::models::item::{ActiveModel, Column, Entity, Model};
use crate::models::{RecordStatus, TargetCollection};
use crate::repositories::{QueueRepository, UsageCharge, UsageRepository};

#[derive(Clone)]
pub struct ItemRepository {
    db: DatabaseConnection,
}

impl ItemRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Creates a `CREATED` item and its queue entry in one transaction.
    pub async fn create(
        &self,
        queue: &QueueRepository,
        user_id: Uuid,
        podcast_id: Uuid,
        url: &str,
    ) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let item = ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            podcast_id: Set(podcast_id),
            url: Set(url.to_string()),
            status: Set(RecordStatus::Created),
            title: Set(None),
            error: Set(None),
            download_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        queue
            .add_job_with(&txn, item.id, TargetCollection::Items)
            .await?;
        txn.commit().await?;

        Ok(item)
    }

    pub async fn find(&self, item_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(item_id).one(&self.db).await
    }

    /// Successful items of a podcast with their downloads, oldest first.
    pub async fn list_published(
        &self,
        podcast_id: Uuid,
    ) -> Result<Vec<(Model, download::Model)>, DbErr> {
        let rows = Entity::find()
            .filter(Column::PodcastId.eq(podcast_id))
            .filter(Column::Status.eq(RecordStatus::Success))
            .order_by_asc(Column::CreatedAt)
            .find_also_related(download::Entity)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(item, download)| download.map(|download| (item, download)))
            .collect())
    }

    pub async fn set_title(
        &self,
        item_id: Uuid,
        title: &str,
        status: RecordStatus,
    ) -> Result<(), DbErr> {
        self.update(
            item_id,
            ActiveModel {
                title: Set(Some(title.to_string())),
                status: Set(status),
                ..Default::default()
            },
        )
        .await
    }

    /// Marks the item `SUCCESS` and applies its usage charge in one
    /// transaction: an attempt either records both or neither, so a retry
    /// after a failed write never charges twice.
    pub async fn complete(
        &self,
        usage: &UsageRepository,
        item_id: Uuid,
        download_id: Uuid,
        charge: UsageCharge,
    ) -> Result<(), DbErr> {
        let txn = self.db.begin().await?;
        usage.charge_with(&txn, charge).await?;
        update_on(
            &txn,
            item_id,
            ActiveModel {
                status: Set(RecordStatus::Success),
                download_id: Set(Some(download_id)),
                error: Set(None),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await
    }

    pub async fn mark_error(&self, item_id: Uuid, message: &str) -> Result<(), DbErr> {
        self.update(
            item_id,
            ActiveModel {
                status: Set(RecordStatus::Error),
                error: Set(Some(message.to_string())),
                ..Default::default()
            },
        )
        .await
    }

    async fn update(&self, item_id: Uuid, changes: ActiveModel) -> Result<(), DbErr> {
        update_on(&self.db, item_id, changes).await
    }
}

async fn update_on<C: ConnectionTrait>(
    conn: &C,
    item_id: Uuid,
    mut changes: ActiveModel,
) -> Result<(), DbErr> {
    changes.updated_at = Set(Utc::now().fixed_offset());
    Entity::update_many()
        .set(changes)
        .filter(Column::Id.eq(item_id))
        .exec(conn)
        .await?;
    Ok(())
}
