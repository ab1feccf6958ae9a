//! Download entity model
//!
//! A stored audio file for one remote content id. Rows are shared: every job
//! or item that resolves to the same content id points at the same download.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "downloads")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Remote content id (the video id). Unique.
    #[sea_orm(unique)]
    pub content_id: String,

    pub title: String,

    pub channel: Option<String>,

    pub description: Option<String>,

    pub duration_seconds: Option<f64>,

    /// Size of the stored audio file in bytes
    pub size_bytes: i64,

    /// Key of the audio file in file storage
    pub file_key: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
