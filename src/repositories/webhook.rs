//! # Webhook Repository
//!
//! Webhook subscriptions and their delivery log.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::webhook::{self, Entity as WebhookEntity};
use crate::models::webhook_event::{self, Entity as WebhookEventEntity};
use crate::models::{DeliveryStatus, WebhookEventKind};

#[derive(Clone)]
pub struct WebhookRepository {
    db: DatabaseConnection,
}

impl WebhookRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Registers (or replaces) the webhook of `user_id`.
    pub async fn upsert(
        &self,
        user_id: Uuid,
        url: &str,
        events: &[WebhookEventKind],
        secret: Option<&str>,
    ) -> Result<webhook::Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let events = JsonValue::Array(
            events
                .iter()
                .map(|event| JsonValue::String(event.as_str().to_string()))
                .collect(),
        );

        if let Some(existing) = self.find_for_user(user_id).await? {
            let mut active: webhook::ActiveModel = existing.into();
            active.url = Set(url.to_string());
            active.events = Set(events);
            active.secret = Set(secret.map(str::to_string));
            active.enabled = Set(true);
            active.updated_at = Set(now);
            return active.update(&self.db).await;
        }

        webhook::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            url: Set(url.to_string()),
            events: Set(events),
            secret: Set(secret.map(str::to_string)),
            enabled: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    pub async fn find_for_user(&self, user_id: Uuid) -> Result<Option<webhook::Model>, DbErr> {
        WebhookEntity::find()
            .filter(webhook::Column::UserId.eq(user_id))
            .one(&self.db)
            .await
    }

    /// Logs a delivery about to be attempted.
    pub async fn record_event(
        &self,
        webhook_id: Uuid,
        job_id: Uuid,
        event: WebhookEventKind,
    ) -> Result<webhook_event::Model, DbErr> {
        let now = Utc::now().fixed_offset();
        webhook_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            webhook_id: Set(webhook_id),
            job_id: Set(job_id),
            event: Set(event),
            status: Set(DeliveryStatus::Active),
            attempts: Set(0),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    pub async fn record_attempt(
        &self,
        event_id: Uuid,
        attempts: i32,
        status: DeliveryStatus,
        last_error: Option<String>,
    ) -> Result<(), DbErr> {
        WebhookEventEntity::update_many()
            .set(webhook_event::ActiveModel {
                attempts: Set(attempts),
                status: Set(status),
                last_error: Set(last_error),
                updated_at: Set(Utc::now().fixed_offset()),
                ..Default::default()
            })
            .filter(webhook_event::Column::Id.eq(event_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn events_for_job(&self, job_id: Uuid) -> Result<Vec<webhook_event::Model>, DbErr> {
        WebhookEventEntity::find()
            .filter(webhook_event::Column::JobId.eq(job_id))
            .order_by_asc(webhook_event::Column::CreatedAt)
            .all(&self.db)
            .await
    }
}
