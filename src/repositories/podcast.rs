//! # Podcast Repository

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use crate::models::podcast::{ActiveModel, Column, Entity, Model};

#[derive(Clone)]
pub struct PodcastRepository {
    db: DatabaseConnection,
}

impl PodcastRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        title: &str,
        description: Option<&str>,
    ) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            title: Set(title.to_string()),
            description: Set(description.map(str::to_string)),
            feed_key: Set(None),
            feed_updated_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    pub async fn find(&self, podcast_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(podcast_id).one(&self.db).await
    }

    /// Points the podcast at a freshly published feed manifest.
    pub async fn record_feed(
        &self,
        podcast_id: Uuid,
        feed_key: &str,
        published_at: DateTimeWithTimeZone,
    ) -> Result<(), DbErr> {
        Entity::update_many()
            .set(ActiveModel {
                feed_key: Set(Some(feed_key.to_string())),
                feed_updated_at: Set(Some(published_at)),
                updated_at: Set(published_at),
                ..Default::default()
            })
            .filter(Column::Id.eq(podcast_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
