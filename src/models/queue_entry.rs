//! QueueEntry entity model
//!
//! A queue entry is one durable unit of background work: "process the record
//! `target_id` of collection `target_collection`". The dispatcher moves it
//! through `PENDING -> PROCESSING -> {COMPLETED | PENDING | FAILED}`.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle state of a queue entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "PROCESSING")]
    Processing,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "FAILED")]
    Failed,
    /// Accepted by the schema for operator tooling; the dispatcher never
    /// produces or claims it.
    #[sea_orm(string_value = "WAITING")]
    Waiting,
}

/// Collection a queue entry's target record lives in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum TargetCollection {
    #[sea_orm(string_value = "jobs")]
    Jobs,
    #[sea_orm(string_value = "items")]
    Items,
}

impl TargetCollection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetCollection::Jobs => "jobs",
            TargetCollection::Items => "items",
        }
    }
}

impl fmt::Display for TargetCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "queue_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Id of the record to process, resolved in `target_collection`
    pub target_id: Uuid,

    pub target_collection: TargetCollection,

    pub status: QueueStatus,

    /// Claimant of a `PROCESSING` entry; null in every other state
    pub worker_id: Option<String>,

    /// Failed attempts so far. Never decreases.
    pub retry_count: i32,

    pub max_retries: i32,

    pub last_error: Option<String>,

    /// Egress key selected for the most recent attempt
    pub last_proxy: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
