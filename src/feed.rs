//! Podcast feed publishing.
//!
//! A podcast's feed is a JSON manifest listing its successful items with
//! the public URLs of their audio files. The manifest is rewritten in full
//! whenever an item finishes. Rebuilds of one podcast are serialized, so the
//! last manifest written is always built from the latest item state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::repositories::{ItemRepository, PodcastRepository};
use crate::storage::{FileStorage, StorageError};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("podcast {0} not found")]
    PodcastNotFound(Uuid),
    #[error("feed database error: {0}")]
    Database(#[from] DbErr),
    #[error("feed storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("feed serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait FeedPublisher: Send + Sync {
    /// Rebuilds and publishes the feed of `podcast_id`, returning its storage key.
    async fn regenerate(&self, podcast_id: Uuid) -> Result<String, FeedError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedManifest {
    pub podcast_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub updated_at: DateTime<FixedOffset>,
    pub episodes: Vec<FeedEpisode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEpisode {
    pub item_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub audio_url: String,
    pub size_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub published_at: DateTime<FixedOffset>,
}

pub fn feed_key(podcast_id: Uuid) -> String {
    format!("feeds/{podcast_id}.json")
}

/// Publishes manifests through [`FileStorage`] and records them on the podcast.
#[derive(Clone)]
pub struct ManifestFeedPublisher {
    podcasts: PodcastRepository,
    items: ItemRepository,
    storage: Arc<dyn FileStorage>,
    locks: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl ManifestFeedPublisher {
    pub fn new(
        podcasts: PodcastRepository,
        items: ItemRepository,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        Self {
            podcasts,
            items,
            storage,
            locks: Arc::default(),
        }
    }

    fn podcast_lock(&self, podcast_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Drop locks nobody holds any more.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(podcast_id).or_default().clone()
    }

    async fn build(&self, podcast_id: Uuid) -> Result<FeedManifest, FeedError> {
        let podcast = self
            .podcasts
            .find(podcast_id)
            .await?
            .ok_or(FeedError::PodcastNotFound(podcast_id))?;

        let episodes = self
            .items
            .list_published(podcast_id)
            .await?
            .into_iter()
            .map(|(item, download)| FeedEpisode {
                item_id: item.id,
                title: item.title.unwrap_or_else(|| download.title.clone()),
                channel: download.channel,
                audio_url: self.storage.url_for(&download.file_key),
                size_bytes: download.size_bytes,
                duration_seconds: download.duration_seconds,
                published_at: item.updated_at,
            })
            .collect();

        Ok(FeedManifest {
            podcast_id,
            title: podcast.title,
            description: podcast.description,
            updated_at: Utc::now().fixed_offset(),
            episodes,
        })
    }
}

#[async_trait]
impl FeedPublisher for ManifestFeedPublisher {
    #[instrument(skip(self))]
    async fn regenerate(&self, podcast_id: Uuid) -> Result<String, FeedError> {
        let lock = self.podcast_lock(podcast_id);
        let _publishing = lock.lock().await;

        let manifest = self.build(podcast_id).await?;
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        let key = feed_key(podcast_id);

        self.storage.put_bytes(&key, &bytes).await?;
        self.podcasts
            .record_feed(podcast_id, &key, manifest.updated_at)
            .await?;

        info!(
            podcast_id = %podcast_id,
            episodes = manifest.episodes.len(),
            "feed published"
        );
        Ok(key)
    }
}
