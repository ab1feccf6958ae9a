//! The download pipeline shared by every handler.
//!
//! ledger, egress, metadata, quota, dedupe, fetch and store. The charge is
//! returned rather than applied: handlers apply it together with the
//! target's `SUCCESS` write.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use sea_orm::DbErr;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::egress::EgressPolicy;
use crate::media::{MediaFetchClient, estimate_size_bytes};
use crate::models::download;
use crate::repositories::{DownloadRepository, QueueRepository, UsageCharge, UsageRepository};
use crate::storage::{FileStorage, audio_key};
use crate::workers::{DispatchContext, JobError};

/// The target-record side of a pipeline run.
#[async_trait]
pub trait TargetRecord: Send + Sync {
    /// Metadata is known: record the title and move the record to `PROCESSING`.
    async fn metadata_resolved(&self, title: &str) -> Result<(), DbErr>;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineRequest<'a> {
    pub user_id: Uuid,
    pub url: &'a str,
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Stored {
        download: download::Model,
        charge: UsageCharge,
    },
    Reused {
        download: download::Model,
        charge: UsageCharge,
    },
    /// Nothing was downloaded and nothing is owed
    QuotaExceeded { message: String },
}

#[derive(Clone)]
pub struct DownloadPipeline {
    queue: QueueRepository,
    usage: UsageRepository,
    downloads: DownloadRepository,
    media: Arc<MediaFetchClient>,
    storage: Arc<dyn FileStorage>,
    egress: Arc<EgressPolicy>,
}

impl DownloadPipeline {
    pub fn new(
        queue: QueueRepository,
        usage: UsageRepository,
        downloads: DownloadRepository,
        media: Arc<MediaFetchClient>,
        storage: Arc<dyn FileStorage>,
        egress: Arc<EgressPolicy>,
    ) -> Self {
        Self {
            queue,
            usage,
            downloads,
            media,
            storage,
            egress,
        }
    }

    pub fn usage(&self) -> &UsageRepository {
        &self.usage
    }

    #[instrument(
        skip_all,
        fields(entry_id = %ctx.entry.id, user_id = %request.user_id, retry_count = ctx.entry.retry_count)
    )]
    pub async fn run(
        &self,
        ctx: &DispatchContext,
        request: PipelineRequest<'_>,
        target: &dyn TargetRecord,
    ) -> Result<PipelineOutcome, JobError> {
        let ledger = self
            .usage
            .current_or_rolled(request.user_id)
            .await?
            .ok_or_else(|| {
                JobError::MissingReference(format!(
                    "no active usage cycle for user {}",
                    request.user_id
                ))
            })?;

        let egress = self.egress.select_egress(ctx.entry.retry_count);
        counter!("egress_tier_selected_total", "egress" => egress.key.clone()).increment(1);
        match self
            .queue
            .record_last_proxy(ctx.entry.id, &ctx.worker_id, &egress.key)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(egress = %egress.key, "entry no longer owned; last proxy not recorded"),
            Err(err) => warn!(error = ?err, egress = %egress.key, "failed to record last proxy"),
        }

        let metadata = self.media.get_info(request.url, &egress).await?;
        target.metadata_resolved(&metadata.title).await?;

        let estimate = estimate_size_bytes(&metadata);
        if ledger.would_exceed(estimate) {
            info!(
                usage = ledger.usage_bytes,
                limit = ledger.limit_bytes,
                estimate,
                "monthly quota would be exceeded"
            );
            return Ok(PipelineOutcome::QuotaExceeded {
                message: quota_message(ledger.usage_bytes, ledger.limit_bytes, estimate),
            });
        }

        if let Some(existing) = self
            .downloads
            .find_by_content_id(&metadata.content_id)
            .await?
        {
            debug!(download_id = %existing.id, "reusing existing download");
            let charge = UsageCharge {
                ledger_id: ledger.id,
                bytes: existing.size_bytes,
            };
            return Ok(PipelineOutcome::Reused {
                download: existing,
                charge,
            });
        }

        let fetched = self
            .media
            .download(request.url, &metadata, &egress, ctx.entry.retry_count)
            .await?;
        let _scratch = scopeguard::guard(fetched.path.clone(), remove_scratch_file);

        let stored = self
            .storage
            .store(&fetched.path, &audio_key(&metadata.content_id))
            .await?;
        let (row, created) = self
            .downloads
            .insert_or_existing(&metadata, &stored.key, stored.size_bytes)
            .await?;

        let charge = UsageCharge {
            ledger_id: ledger.id,
            bytes: row.size_bytes,
        };

        if created {
            info!(
                download_id = %row.id,
                content_id = %row.content_id,
                size_bytes = row.size_bytes,
                "download stored"
            );
            Ok(PipelineOutcome::Stored {
                download: row,
                charge,
            })
        } else {
            Ok(PipelineOutcome::Reused {
                download: row,
                charge,
            })
        }
    }
}

fn remove_scratch_file(path: PathBuf) {
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %err, path = %path.display(), "failed to remove scratch file");
        }
    }
}

const MIB: f64 = 1024.0 * 1024.0;

/// User-facing explanation stored on the target record.
pub fn quota_message(usage_bytes: i64, limit_bytes: i64, estimate_bytes: i64) -> String {
    format!(
        "Monthly download limit reached: {:.1} MiB used of {:.1} MiB, this item needs about {:.1} MiB",
        usage_bytes as f64 / MIB,
        limit_bytes as f64 / MIB,
        estimate_bytes as f64 / MIB
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_message_reports_mebibytes() {
        let message = quota_message(1024 * 1024, 2 * 1024 * 1024, 512 * 1024);
        assert_eq!(
            message,
            "Monthly download limit reached: 1.0 MiB used of 2.0 MiB, this item needs about 0.5 MiB"
        );
    }
}
