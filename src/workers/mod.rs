//! # Job Handlers
//!
//! A handler turns one claimed queue entry into finished work for its target
//! collection. The dispatcher owns the queue entry's lifecycle; handlers own
//! their target records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

use crate::feed::FeedError;
use crate::media::FetchError;
use crate::models::{TargetCollection, queue_entry};
use crate::storage::StorageError;

pub mod items;
pub mod jobs;
pub mod pipeline;

pub use items::ItemsHandler;
pub use jobs::JobsHandler;
pub use pipeline::{DownloadPipeline, PipelineOutcome, PipelineRequest, TargetRecord};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{collection} record {target_id} not found")]
    TargetMissing {
        collection: TargetCollection,
        target_id: Uuid,
    },
    #[error("{0}")]
    MissingReference(String),
    #[error("media fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("feed publishing failed: {0}")]
    Feed(#[from] FeedError),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    /// The handler task panicked or was cancelled mid-attempt
    #[error("{0}")]
    Aborted(String),
}

impl JobError {
    /// Whether another attempt may succeed. Non-retryable errors fail the
    /// entry without consuming retry budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::TargetMissing { .. } | JobError::MissingReference(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Target finished with a freshly downloaded file
    Completed { download_id: Uuid },
    /// Target finished with an existing download of the same content
    Reused { download_id: Uuid },
    /// Target marked `ERROR`; the entry is done and must not be retried
    QuotaExceeded,
}

/// What a handler gets for one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub entry: queue_entry::Model,
    /// Owner recorded on the entry by the claim
    pub worker_id: String,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn collection(&self) -> TargetCollection;

    async fn process(&self, ctx: &DispatchContext) -> Result<JobOutcome, JobError>;

    /// Called once the entry has failed for good.
    async fn mark_target_failed(&self, target_id: Uuid, message: &str) -> Result<(), DbErr>;
}

/// Handlers keyed by the collection they serve.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TargetCollection, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for its collection, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(handler.collection(), handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, collection: TargetCollection) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&collection).cloned()
    }

    pub fn collections(&self) -> Vec<TargetCollection> {
        self.handlers.keys().copied().collect()
    }
}
