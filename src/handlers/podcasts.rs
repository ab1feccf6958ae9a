//! # Podcast API Handlers

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
use crate::handlers::is_supported_video_url;
use crate::models::{RecordStatus, item, podcast};
use crate::repositories::{ItemRepository, PodcastRepository};
use crate::server::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePodcastRequest {
    pub user_id: Uuid,
    #[schema(example = "Morning listening")]
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PodcastInfo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Public URL of the feed manifest, once published
    pub feed_url: Option<String>,
    #[schema(value_type = Option<String>)]
    pub feed_updated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateItemRequest {
    pub user_id: Uuid,
    #[schema(example = "https://www.youtube.com/watch?v=dQw4w9WgXcQ")]
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ItemInfo {
    pub id: Uuid,
    pub podcast_id: Uuid,
    pub url: String,
    pub status: RecordStatus,
    pub title: Option<String>,
    pub error: Option<String>,
    pub download_id: Option<Uuid>,
    #[schema(value_type = String)]
    pub created_at: DateTimeWithTimeZone,
}

impl From<item::Model> for ItemInfo {
    fn from(model: item::Model) -> Self {
        Self {
            id: model.id,
            podcast_id: model.podcast_id,
            url: model.url,
            status: model.status,
            title: model.title,
            error: model.error,
            download_id: model.download_id,
            created_at: model.created_at,
        }
    }
}

fn podcast_info(state: &AppState, model: podcast::Model) -> PodcastInfo {
    PodcastInfo {
        feed_url: model.feed_key.as_deref().map(|key| state.storage.url_for(key)),
        id: model.id,
        user_id: model.user_id,
        title: model.title,
        description: model.description,
        feed_updated_at: model.feed_updated_at,
    }
}

/// Create a podcast
#[utoipa::path(
    post,
    path = "/api/v1/podcasts",
    request_body = CreatePodcastRequest,
    responses(
        (status = 201, description = "Podcast created", body = PodcastInfo),
        (status = 400, description = "Invalid request", body = ApiError)
    ),
    tag = "podcasts"
)]
pub async fn create_podcast(
    State(state): State<AppState>,
    payload: Result<Json<CreatePodcastRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PodcastInfo>), ApiError> {
    let Json(request) = payload?;
    let title = request.title.trim();
    if title.is_empty() {
        return Err(validation_error(
            "Invalid podcast",
            json!({ "title": "Must not be empty" }),
        ));
    }

    let podcast = PodcastRepository::new(state.db.clone())
        .create(request.user_id, title, request.description.as_deref())
        .await?;

    Ok((StatusCode::CREATED, Json(podcast_info(&state, podcast))))
}

/// Get a podcast and its feed location
#[utoipa::path(
    get,
    path = "/api/v1/podcasts/{podcast_id}",
    params(("podcast_id" = Uuid, Path, description = "Podcast identifier")),
    responses(
        (status = 200, description = "Podcast", body = PodcastInfo),
        (status = 404, description = "Podcast not found", body = ApiError)
    ),
    tag = "podcasts"
)]
pub async fn get_podcast(
    State(state): State<AppState>,
    Path(podcast_id): Path<Uuid>,
) -> Result<Json<PodcastInfo>, ApiError> {
    let podcast = PodcastRepository::new(state.db.clone())
        .find(podcast_id)
        .await?
        .ok_or_else(|| not_found("Podcast", podcast_id))?;

    Ok(Json(podcast_info(&state, podcast)))
}

/// Add an episode to a podcast from a video URL
#[utoipa::path(
    post,
    path = "/api/v1/podcasts/{podcast_id}/items",
    params(("podcast_id" = Uuid, Path, description = "Podcast identifier")),
    request_body = CreateItemRequest,
    responses(
        (status = 201, description = "Item created and enqueued", body = ItemInfo),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Podcast not found", body = ApiError)
    ),
    tag = "podcasts"
)]
pub async fn create_item(
    State(state): State<AppState>,
    Path(podcast_id): Path<Uuid>,
    payload: Result<Json<CreateItemRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ItemInfo>), ApiError> {
    let Json(request) = payload?;
    if !is_supported_video_url(&request.url) {
        return Err(validation_error(
            "Unsupported video URL",
            json!({ "url": request.url }),
        ));
    }

    let podcast = PodcastRepository::new(state.db.clone())
        .find(podcast_id)
        .await?
        .ok_or_else(|| not_found("Podcast", podcast_id))?;

    let item = ItemRepository::new(state.db.clone())
        .create(&state.queue, request.user_id, podcast.id, request.url.trim())
        .await?;

    Ok((StatusCode::CREATED, Json(item.into())))
}
