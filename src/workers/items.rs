//! Handler for the `items` collection: podcast episodes. A finished item
//! republishes its podcast's feed.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::DbErr;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::feed::FeedPublisher;
use crate::models::{RecordStatus, TargetCollection};
use crate::repositories::{ItemRepository, PodcastRepository};
use crate::workers::{
    DispatchContext, DownloadPipeline, JobError, JobHandler, JobOutcome, PipelineOutcome,
    PipelineRequest, TargetRecord,
};

pub struct ItemsHandler {
    items: ItemRepository,
    podcasts: PodcastRepository,
    pipeline: DownloadPipeline,
    feed: Arc<dyn FeedPublisher>,
}

impl ItemsHandler {
    pub fn new(
        items: ItemRepository,
        podcasts: PodcastRepository,
        pipeline: DownloadPipeline,
        feed: Arc<dyn FeedPublisher>,
    ) -> Self {
        Self {
            items,
            podcasts,
            pipeline,
            feed,
        }
    }
}

struct ItemTarget<'a> {
    items: &'a ItemRepository,
    item_id: Uuid,
}

#[async_trait]
impl TargetRecord for ItemTarget<'_> {
    async fn metadata_resolved(&self, title: &str) -> Result<(), DbErr> {
        self.items
            .set_title(self.item_id, title, RecordStatus::Processing)
            .await
    }
}

#[async_trait]
impl JobHandler for ItemsHandler {
    fn collection(&self) -> TargetCollection {
        TargetCollection::Items
    }

    #[instrument(skip_all, fields(item_id = %ctx.entry.target_id))]
    async fn process(&self, ctx: &DispatchContext) -> Result<JobOutcome, JobError> {
        let item_id = ctx.entry.target_id;
        let item = self
            .items
            .find(item_id)
            .await?
            .ok_or(JobError::TargetMissing {
                collection: TargetCollection::Items,
                target_id: item_id,
            })?;

        let podcast = self.podcasts.find(item.podcast_id).await?.ok_or_else(|| {
            JobError::MissingReference(format!("podcast {} not found", item.podcast_id))
        })?;

        // Finished on an earlier attempt whose feed update failed.
        if let (RecordStatus::Success, Some(download_id)) = (item.status, item.download_id) {
            debug!("item already downloaded; republishing feed");
            self.feed.regenerate(podcast.id).await?;
            return Ok(JobOutcome::Reused { download_id });
        }

        let target = ItemTarget {
            items: &self.items,
            item_id,
        };
        let request = PipelineRequest {
            user_id: item.user_id,
            url: &item.url,
        };

        let (download, charge, outcome) = match self.pipeline.run(ctx, request, &target).await? {
            PipelineOutcome::Stored { download, charge } => {
                let download_id = download.id;
                (download, charge, JobOutcome::Completed { download_id })
            }
            PipelineOutcome::Reused { download, charge } => {
                let download_id = download.id;
                (download, charge, JobOutcome::Reused { download_id })
            }
            PipelineOutcome::QuotaExceeded { message } => {
                self.items.mark_error(item_id, &message).await?;
                return Ok(JobOutcome::QuotaExceeded);
            }
        };

        // Charged with the SUCCESS write; a failed publish below is retried
        // through the short-circuit above without charging again.
        self.items
            .complete(self.pipeline.usage(), item_id, download.id, charge)
            .await?;
        self.feed.regenerate(podcast.id).await?;
        Ok(outcome)
    }

    async fn mark_target_failed(&self, target_id: Uuid, message: &str) -> Result<(), DbErr> {
        self.items.mark_error(target_id, message).await
    }
}
