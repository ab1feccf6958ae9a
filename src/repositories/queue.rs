//! # Queue Repository
//!
//! Persistence operations for `queue_entries`. Every write made after a claim
//! is fenced on the claimant's `worker_id`: if the entry was reset and claimed
//! by someone else in the meantime, the stale write matches no row and is
//! reported back as `false`/`None` instead of clobbering the new owner.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::models::queue_entry::{ActiveModel, Column, Entity, Model};
use crate::models::{QueueStatus, TargetCollection};

/// What a recorded failure did to the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Entry is back to `PENDING` and will be claimed again.
    Retry { retry_count: i32 },
    /// Budget exhausted; entry is `FAILED`.
    Exhausted { retry_count: i32 },
}

impl FailureDisposition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureDisposition::Exhausted { .. })
    }

    pub fn retry_count(&self) -> i32 {
        match self {
            FailureDisposition::Retry { retry_count }
            | FailureDisposition::Exhausted { retry_count } => *retry_count,
        }
    }
}

/// Repository for queue entry operations
#[derive(Clone)]
pub struct QueueRepository {
    db: DatabaseConnection,
    default_max_retries: i32,
}

impl QueueRepository {
    pub fn new(db: DatabaseConnection, default_max_retries: i32) -> Self {
        Self {
            db,
            default_max_retries,
        }
    }

    pub fn default_max_retries(&self) -> i32 {
        self.default_max_retries
    }

    /// Enqueue `target_id` of `collection` as a new `PENDING` entry.
    pub async fn add_job(
        &self,
        target_id: Uuid,
        collection: TargetCollection,
    ) -> Result<Model, DbErr> {
        self.add_job_with(&self.db, target_id, collection).await
    }

    /// Same as [`Self::add_job`] on a caller-supplied connection, so the entry
    /// can be created in the same transaction as its target record.
    pub async fn add_job_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        target_id: Uuid,
        collection: TargetCollection,
    ) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();

        let entry = ActiveModel {
            id: Set(Uuid::new_v4()),
            target_id: Set(target_id),
            target_collection: Set(collection),
            status: Set(QueueStatus::Pending),
            worker_id: Set(None),
            retry_count: Set(0),
            max_retries: Set(self.default_max_retries),
            last_error: Set(None),
            last_proxy: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        tracing::info!(
            queue_id = %entry.id,
            target_id = %target_id,
            collection = %collection,
            "queue entry added"
        );

        Ok(entry)
    }

    pub async fn find(&self, entry_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(entry_id).one(&self.db).await
    }

    /// Most recent entry for a target record.
    pub async fn find_for_target(
        &self,
        collection: TargetCollection,
        target_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::TargetCollection.eq(collection))
            .filter(Column::TargetId.eq(target_id))
            .order_by_desc(Column::CreatedAt)
            .one(&self.db)
            .await
    }

    /// Returns every `PROCESSING` entry to `PENDING` and clears its worker.
    /// Running it again finds nothing to reset.
    pub async fn reset_hanging_entries(&self) -> Result<u64, DbErr> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .set(ActiveModel {
                status: Set(QueueStatus::Pending),
                worker_id: Set(None),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(Column::Status.eq(QueueStatus::Processing))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }

    pub async fn count_processing(&self) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(QueueStatus::Processing))
            .count(&self.db)
            .await
    }

    /// Oldest `PENDING` entries first, by last update then creation.
    pub async fn fetch_pending(&self, limit: u64) -> Result<Vec<Model>, DbErr> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        Entity::find()
            .filter(Column::Status.eq(QueueStatus::Pending))
            .order_by_asc(Column::UpdatedAt)
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
    }

    /// Attempts to move `entry_id` from `PENDING` to `PROCESSING` under
    /// `worker_id`.
    ///
    /// The status is re-read inside a transaction and the update is
    /// conditional on the entry still being `PENDING`, so of any number of
    /// concurrent claimants exactly one sees a row affected. Losers get
    /// `Ok(None)`.
    pub async fn claim(&self, entry_id: Uuid, worker_id: &str) -> Result<Option<Model>, DbErr> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let current = Entity::find_by_id(entry_id).one(&txn).await?;
        let is_pending = matches!(&current, Some(entry) if entry.status == QueueStatus::Pending);
        if !is_pending {
            txn.commit().await?;
            return Ok(None);
        }

        let update_result = Entity::update_many()
            .set(ActiveModel {
                status: Set(QueueStatus::Processing),
                worker_id: Set(Some(worker_id.to_string())),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(Column::Id.eq(entry_id))
            .filter(Column::Status.eq(QueueStatus::Pending)) // Double-check it is still pending
            .exec(&txn)
            .await?;

        txn.commit().await?;

        if update_result.rows_affected != 1 {
            return Ok(None);
        }

        Entity::find_by_id(entry_id).one(&self.db).await
    }

    /// Records which egress the current attempt uses.
    pub async fn record_last_proxy(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        egress_key: &str,
    ) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .set(ActiveModel {
                last_proxy: Set(Some(egress_key.to_string())),
                ..Default::default()
            })
            .filter(owned_by(entry_id, worker_id))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// `PROCESSING -> COMPLETED`, clearing the worker.
    pub async fn mark_completed(&self, entry_id: Uuid, worker_id: &str) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .set(ActiveModel {
                status: Set(QueueStatus::Completed),
                worker_id: Set(None),
                updated_at: Set(Utc::now().fixed_offset()),
                ..Default::default()
            })
            .filter(owned_by(entry_id, worker_id))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Consumes one unit of retry budget for a failed attempt.
    ///
    /// `retry_count` is incremented and `last_error` recorded; once the count
    /// reaches `max_retries` the entry becomes `FAILED`, otherwise it returns
    /// to `PENDING`. Returns `None` when `worker_id` no longer owns the entry.
    pub async fn record_failure(
        &self,
        entry: &Model,
        worker_id: &str,
        message: &str,
    ) -> Result<Option<FailureDisposition>, DbErr> {
        let retry_count = entry.retry_count.saturating_add(1);
        let disposition = if retry_count >= entry.max_retries {
            FailureDisposition::Exhausted { retry_count }
        } else {
            FailureDisposition::Retry { retry_count }
        };
        let status = if disposition.is_terminal() {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };

        let result = Entity::update_many()
            .set(ActiveModel {
                status: Set(status),
                worker_id: Set(None),
                retry_count: Set(retry_count),
                last_error: Set(Some(message.to_string())),
                updated_at: Set(Utc::now().fixed_offset()),
                ..Default::default()
            })
            .filter(owned_by(entry.id, worker_id))
            .filter(Column::RetryCount.eq(entry.retry_count))
            .exec(&self.db)
            .await?;

        Ok((result.rows_affected == 1).then_some(disposition))
    }

    /// Terminal failure that does not consume retry budget.
    pub async fn mark_failed_without_retry(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        message: &str,
    ) -> Result<bool, DbErr> {
        let result = Entity::update_many()
            .set(ActiveModel {
                status: Set(QueueStatus::Failed),
                worker_id: Set(None),
                last_error: Set(Some(message.to_string())),
                updated_at: Set(Utc::now().fixed_offset()),
                ..Default::default()
            })
            .filter(owned_by(entry_id, worker_id))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }
}

fn owned_by(entry_id: Uuid, worker_id: &str) -> sea_orm::Condition {
    sea_orm::Condition::all()
        .add(Column::Id.eq(entry_id))
        .add(Column::Status.eq(QueueStatus::Processing))
        .add(Column::WorkerId.eq(worker_id))
}
