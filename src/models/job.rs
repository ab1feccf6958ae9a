//! Job entity model
//!
//! A job is a single URL submitted through the conversion API. Jobs created by
//! the same request share a `batch_id`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

use super::record_status::RecordStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owner of the job; usage is charged to this user
    pub user_id: Uuid,

    /// Source video URL
    pub url: String,

    /// Groups jobs submitted together
    pub batch_id: Uuid,

    pub status: RecordStatus,

    /// Title copied from the remote metadata once known
    pub title: Option<String>,

    /// User-facing error message when `status` is `ERROR`
    pub error: Option<String>,

    /// Download produced (or reused) for this job
    pub download_id: Option<Uuid>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::download::Entity",
        from = "Column::DownloadId",
        to = "super::download::Column::Id"
    )]
    Download,
}

impl Related<super::download::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Download.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
