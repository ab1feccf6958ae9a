//! # Download Repository
//!
//! Downloads are keyed by remote content id. Inserts race safely: when two
//! workers produce the same content concurrently, the loser of the unique
//! index adopts the winner's row.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::media::MediaMetadata;
use crate::models::download::{ActiveModel, Column, Entity, Model};

#[derive(Clone)]
pub struct DownloadRepository {
    db: DatabaseConnection,
}

impl DownloadRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find(&self, download_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(download_id).one(&self.db).await
    }

    pub async fn find_by_content_id(&self, content_id: &str) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::ContentId.eq(content_id))
            .one(&self.db)
            .await
    }

    /// Inserts a download row, or returns the existing row for the same
    /// content id. The flag is `true` when this call created the row.
    pub async fn insert_or_existing(
        &self,
        metadata: &MediaMetadata,
        file_key: &str,
        size_bytes: i64,
    ) -> Result<(Model, bool), DbErr> {
        let now = Utc::now().fixed_offset();
        let insert = ActiveModel {
            id: Set(Uuid::new_v4()),
            content_id: Set(metadata.content_id.clone()),
            title: Set(metadata.title.clone()),
            channel: Set(metadata.channel.clone()),
            description: Set(metadata.description.clone()),
            duration_seconds: Set(metadata.duration_seconds),
            size_bytes: Set(size_bytes),
            file_key: Set(file_key.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await;

        match insert {
            Ok(model) => Ok((model, true)),
            Err(err) if is_unique_violation(&err) => {
                tracing::debug!(
                    content_id = %metadata.content_id,
                    "download already recorded by a concurrent worker"
                );
                let existing = self.find_by_content_id(&metadata.content_id).await?;
                existing
                    .map(|model| (model, false))
                    .ok_or(err)
            }
            Err(err) => Err(err),
        }
    }
}
