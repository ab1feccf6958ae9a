//! # Jobs API Handlers
//!
//! Batch submission and status lookup for standalone conversion jobs.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, not_found, validation_error};
use crate::handlers::{MAX_BATCH_URLS, is_supported_video_url};
use crate::models::{RecordStatus, WebhookEventKind, download, job};
use crate::repositories::JobRepository;
use crate::server::AppState;
use crate::storage::FileStorage;

/// Request body for submitting a batch of jobs
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateJobsRequest {
    /// Owner of the jobs; their usage cycle is charged
    pub user_id: Uuid,
    /// Video URLs to convert (1 to 25)
    #[schema(example = json!(["https://www.youtube.com/watch?v=dQw4w9WgXcQ"]))]
    pub urls: Vec<String>,
}

/// Stored audio of a finished job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DownloadInfo {
    pub id: Uuid,
    pub content_id: String,
    pub title: String,
    pub channel: Option<String>,
    pub duration_seconds: Option<f64>,
    pub size_bytes: i64,
    /// Public URL of the MP3 file
    pub audio_url: String,
}

impl DownloadInfo {
    pub fn from_model(model: download::Model, storage: &dyn FileStorage) -> Self {
        Self {
            audio_url: storage.url_for(&model.file_key),
            id: model.id,
            content_id: model.content_id,
            title: model.title,
            channel: model.channel,
            duration_seconds: model.duration_seconds,
            size_bytes: model.size_bytes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub url: String,
    pub status: RecordStatus,
    pub title: Option<String>,
    pub error: Option<String>,
    /// Present once the job succeeded
    pub download: Option<DownloadInfo>,
    #[schema(value_type = String, example = "2025-10-01T12:00:00Z")]
    pub created_at: DateTimeWithTimeZone,
    #[schema(value_type = String, example = "2025-10-01T12:00:00Z")]
    pub updated_at: DateTimeWithTimeZone,
}

impl JobInfo {
    fn new(model: job::Model, download: Option<DownloadInfo>) -> Self {
        Self {
            id: model.id,
            batch_id: model.batch_id,
            url: model.url,
            status: model.status,
            title: model.title,
            error: model.error,
            download,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateJobsResponse {
    pub batch_id: Uuid,
    pub jobs: Vec<JobInfo>,
}

/// Number of jobs per status
#[derive(Debug, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct BatchCounts {
    pub created: usize,
    pub started: usize,
    pub processing: usize,
    pub success: usize,
    pub error: usize,
}

impl BatchCounts {
    fn add(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Created => self.created += 1,
            RecordStatus::Started => self.started += 1,
            RecordStatus::Processing => self.processing += 1,
            RecordStatus::Success => self.success += 1,
            RecordStatus::Error => self.error += 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BatchResponse {
    pub batch_id: Uuid,
    pub total: usize,
    pub counts: BatchCounts,
    /// Every job reached `SUCCESS` or `ERROR`
    pub finished: bool,
    pub jobs: Vec<JobInfo>,
}

fn validate_urls(urls: &[String]) -> Result<(), ApiError> {
    if urls.is_empty() {
        return Err(validation_error(
            "No URLs submitted",
            json!({ "urls": "At least one URL is required" }),
        ));
    }
    if urls.len() > MAX_BATCH_URLS {
        return Err(validation_error(
            "Too many URLs",
            json!({ "urls": format!("At most {MAX_BATCH_URLS} URLs per batch") }),
        ));
    }

    let invalid: Vec<_> = urls
        .iter()
        .enumerate()
        .filter(|(_, url)| !is_supported_video_url(url))
        .map(|(index, url)| json!({ "index": index, "url": url }))
        .collect();
    if !invalid.is_empty() {
        return Err(validation_error(
            "Unsupported video URL",
            json!({ "urls": invalid }),
        ));
    }

    Ok(())
}

/// Submit a batch of video URLs for conversion
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    request_body = CreateJobsRequest,
    responses(
        (status = 201, description = "Jobs created and enqueued", body = CreateJobsResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn create_jobs(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobsRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateJobsResponse>), ApiError> {
    let Json(request) = payload?;
    validate_urls(&request.urls)?;

    let urls: Vec<String> = request.urls.iter().map(|url| url.trim().to_string()).collect();
    let repo = JobRepository::new(state.db.clone());
    let (batch_id, jobs) = repo
        .create_batch(&state.queue, request.user_id, &urls)
        .await?;

    for job in &jobs {
        state
            .notifier
            .send(job, WebhookEventKind::Created, None)
            .await;
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateJobsResponse {
            batch_id,
            jobs: jobs
                .into_iter()
                .map(|job| JobInfo::new(job, None))
                .collect(),
        }),
    ))
}

/// Get a job's status
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{job_id}",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Job status", body = JobInfo),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobInfo>, ApiError> {
    let repo = JobRepository::new(state.db.clone());
    let (job, download) = repo
        .find_with_download(job_id)
        .await?
        .ok_or_else(|| not_found("Job", job_id))?;

    let download = download.map(|model| DownloadInfo::from_model(model, state.storage.as_ref()));
    Ok(Json(JobInfo::new(job, download)))
}

/// Get every job of a batch with per-status counts
#[utoipa::path(
    get,
    path = "/api/v1/batches/{batch_id}",
    params(("batch_id" = Uuid, Path, description = "Batch identifier")),
    responses(
        (status = 200, description = "Batch status", body = BatchResponse),
        (status = 404, description = "Batch not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchResponse>, ApiError> {
    let repo = JobRepository::new(state.db.clone());
    let jobs = repo.list_batch(batch_id).await?;
    if jobs.is_empty() {
        return Err(not_found("Batch", batch_id));
    }

    let mut counts = BatchCounts::default();
    for job in &jobs {
        counts.add(job.status);
    }
    let finished = jobs.iter().all(|job| job.status.is_finished());

    Ok(Json(BatchResponse {
        batch_id,
        total: jobs.len(),
        counts,
        finished,
        jobs: jobs
            .into_iter()
            .map(|job| JobInfo::new(job, None))
            .collect(),
    }))
}
