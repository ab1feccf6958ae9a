//! # Job Repository
//!
//! Jobs are created in batches together with their queue entries, then
//! updated by the jobs handler as processing advances.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::models::download;
use crate::models::job::{ActiveModel, Column, Entity, Model};
use crate::models::{RecordStatus, TargetCollection};
use crate::repositories::{QueueRepository, UsageCharge, UsageRepository};

#[derive(Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
}

impl JobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Creates one `CREATED` job per URL under a fresh batch id and enqueues
    /// each of them, all in one transaction.
    pub async fn create_batch(
        &self,
        queue: &QueueRepository,
        user_id: Uuid,
        urls: &[String],
    ) -> Result<(Uuid, Vec<Model>), DbErr> {
        let batch_id = Uuid::new_v4();
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let mut jobs = Vec::with_capacity(urls.len());
        for url in urls {
            let job = ActiveModel {
                id: Set(Uuid::new_v4()),
                user_id: Set(user_id),
                url: Set(url.clone()),
                batch_id: Set(batch_id),
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
                .add_job_with(&txn, job.id, TargetCollection::Jobs)
                .await?;
            jobs.push(job);
        }

        txn.commit().await?;

        tracing::info!(
            batch_id = %batch_id,
            user_id = %user_id,
            count = jobs.len(),
            "job batch created"
        );

        Ok((batch_id, jobs))
    }

    pub async fn find(&self, job_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id).one(&self.db).await
    }

    pub async fn find_with_download(
        &self,
        job_id: Uuid,
    ) -> Result<Option<(Model, Option<download::Model>)>, DbErr> {
        Entity::find_by_id(job_id)
            .find_also_related(download::Entity)
            .one(&self.db)
            .await
    }

    pub async fn list_batch(&self, batch_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::BatchId.eq(batch_id))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
    }

    pub async fn set_status(&self, job_id: Uuid, status: RecordStatus) -> Result<(), DbErr> {
        self.update(
            job_id,
            ActiveModel {
                status: Set(status),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_title(
        &self,
        job_id: Uuid,
        title: &str,
        status: RecordStatus,
    ) -> Result<(), DbErr> {
        self.update(
            job_id,
            ActiveModel {
                title: Set(Some(title.to_string())),
                status: Set(status),
                ..Default::default()
            },
        )
        .await
    }

    /// Marks the job `SUCCESS` and applies its usage charge in one
    /// transaction: an attempt either records both or neither, so a retry
    /// after a failed write never charges twice.
    pub async fn complete(
        &self,
        usage: &UsageRepository,
        job_id: Uuid,
        download_id: Uuid,
        charge: UsageCharge,
    ) -> Result<(), DbErr> {
        let txn = self.db.begin().await?;
        usage.charge_with(&txn, charge).await?;
        update_on(
            &txn,
            job_id,
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

    pub async fn mark_error(&self, job_id: Uuid, message: &str) -> Result<(), DbErr> {
        self.update(
            job_id,
            ActiveModel {
                status: Set(RecordStatus::Error),
                error: Set(Some(message.to_string())),
                ..Default::default()
            },
        )
        .await
    }

    async fn update(&self, job_id: Uuid, changes: ActiveModel) -> Result<(), DbErr> {
        update_on(&self.db, job_id, changes).await
    }
}

async fn update_on<C: ConnectionTrait>(
    conn: &C,
    job_id: Uuid,
    mut changes: ActiveModel,
) -> Result<(), DbErr> {
    changes.updated_at = Set(Utc::now().fixed_offset());
    Entity::update_many()
        .set(changes)
        .filter(Column::Id.eq(job_id))
        .exec(conn)
        .await?;
    Ok(())
}
