//! Handler for the `jobs` collection: standalone conversions with webhook
//! notifications.

use async_trait::async_trait;
use sea_orm::DbErr;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::{RecordStatus, TargetCollection, WebhookEventKind};
use crate::repositories::JobRepository;
use crate::webhooks::WebhookNotifier;
use crate::workers::{
    DispatchContext, DownloadPipeline, JobError, JobHandler, JobOutcome, PipelineOutcome,
    PipelineRequest, TargetRecord,
};

pub struct JobsHandler {
    jobs: JobRepository,
    pipeline: DownloadPipeline,
    notifier: WebhookNotifier,
}

impl JobsHandler {
    pub fn new(jobs: JobRepository, pipeline: DownloadPipeline, notifier: WebhookNotifier) -> Self {
        Self {
            jobs,
            pipeline,
            notifier,
        }
    }
}

struct JobTarget<'a> {
    jobs: &'a JobRepository,
    job_id: Uuid,
}

#[async_trait]
impl TargetRecord for JobTarget<'_> {
    async fn metadata_resolved(&self, title: &str) -> Result<(), DbErr> {
        self.jobs
            .set_title(self.job_id, title, RecordStatus::Processing)
            .await
    }
}

#[async_trait]
impl JobHandler for JobsHandler {
    fn collection(&self) -> TargetCollection {
        TargetCollection::Jobs
    }

    #[instrument(skip_all, fields(job_id = %ctx.entry.target_id))]
    async fn process(&self, ctx: &DispatchContext) -> Result<JobOutcome, JobError> {
        let job_id = ctx.entry.target_id;
        let job = self
            .jobs
            .find(job_id)
            .await?
            .ok_or(JobError::TargetMissing {
                collection: TargetCollection::Jobs,
                target_id: job_id,
            })?;

        if let (RecordStatus::Success, Some(download_id)) = (job.status, job.download_id) {
            debug!("job already finished");
            return Ok(JobOutcome::Reused { download_id });
        }

        if job.status == RecordStatus::Created {
            self.jobs.set_status(job_id, RecordStatus::Started).await?;
            self.notifier
                .send(&job, WebhookEventKind::Started, None)
                .await;
        }

        let target = JobTarget {
            jobs: &self.jobs,
            job_id,
        };
        let request = PipelineRequest {
            user_id: job.user_id,
            url: &job.url,
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
                self.jobs.mark_error(job_id, &message).await?;
                self.notifier
                    .send(&job, WebhookEventKind::Error, Some(&message))
                    .await;
                return Ok(JobOutcome::QuotaExceeded);
            }
        };

        self.jobs
            .complete(self.pipeline.usage(), job_id, download.id, charge)
            .await?;
        self.notifier
            .send(&job, WebhookEventKind::Success, None)
            .await;

        Ok(outcome)
    }

    async fn mark_target_failed(&self, target_id: Uuid, message: &str) -> Result<(), DbErr> {
        let Some(job) = self.jobs.find(target_id).await? else {
            return Ok(());
        };

        self.jobs.mark_error(target_id, message).await?;
        self.notifier
            .send(&job, WebhookEventKind::Error, Some(message))
            .await;
        Ok(())
    }
}
