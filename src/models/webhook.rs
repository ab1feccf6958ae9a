//! Webhook entity model: a user's notification endpoint.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::webhook_event::WebhookEventKind;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhooks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub user_id: Uuid,

    pub url: String,

    /// JSON array of subscribed event names, e.g. `["SUCCESS", "ERROR"]`
    #[sea_orm(column_type = "JsonBinary")]
    pub events: JsonValue,

    /// Shared secret used to sign deliveries; unsigned when absent
    pub secret: Option<String>,

    pub enabled: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn subscribes_to(&self, event: WebhookEventKind) -> bool {
        self.events
            .as_array()
            .map(|events| {
                events
                    .iter()
                    .filter_map(|value| value.as_str())
                    .any(|name| name.eq_ignore_ascii_case(event.as_str()))
            })
            .unwrap_or(false)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::webhook_event::Entity")]
    WebhookEvent,
}

impl Related<super::webhook_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WebhookEvent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
