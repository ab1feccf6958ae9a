//! Test utilities shared by the integration tests.
//!
//! Builds in-memory SQLite databases with migrations applied and provides
//! fake media tools so the dispatcher and handlers run without `yt-dlp`.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tempfile::TempDir;
use tokio::task::JoinSet;
use uuid::Uuid;

use tubecast::config::{AppConfig, EgressConfig, EgressTierConfig, WebhookConfig};
use tubecast::dispatcher::{QueueDispatcher, TickReport};
use tubecast::media::{FetchError, MediaExtractor, MediaFetchClient, MediaMetadata, Transcoder};
use tubecast::models::monthly_usage;
use tubecast::repositories::UsageRepository;
use tubecast::server::{Services, build_services};
use tubecast::storage::{FileStorage, LocalFileStorage};

/// Bytes written by [`FakeExtractor`] for every download.
pub const PAYLOAD_LEN: usize = 4096;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn video_url(content_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={content_id}")
}

fn content_id_of(url: &str) -> String {
    url.split("v=")
        .nth(1)
        .or_else(|| url.rsplit('/').next())
        .unwrap_or(url)
        .chars()
        .take(11)
        .collect()
}

/// Scripted stand-in for the extraction tool.
///
/// Every call fails while routed through an endpoint listed in
/// `failing_endpoints`; otherwise metadata is derived from the URL and the
/// payload is an ID3-tagged blob of [`PAYLOAD_LEN`] bytes.
#[derive(Default)]
pub struct FakeExtractor {
    pub failing_endpoints: Mutex<HashSet<Option<String>>>,
    pub fail_everything: bool,
    pub duration_seconds: Option<f64>,
    pub metadata_calls: Mutex<Vec<Option<String>>>,
    pub media_calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn failing_through(endpoints: &[Option<&str>]) -> Self {
        Self {
            failing_endpoints: Mutex::new(
                endpoints
                    .iter()
                    .map(|endpoint| endpoint.map(str::to_string))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn endpoints_used(&self) -> Vec<Option<String>> {
        self.metadata_calls.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> usize {
        self.media_calls.load(Ordering::SeqCst)
    }

    fn check(&self, egress: Option<&str>) -> Result<(), FetchError> {
        let blocked = self
            .failing_endpoints
            .lock()
            .unwrap()
            .contains(&egress.map(str::to_string));
        if self.fail_everything || blocked {
            return Err(FetchError::ToolFailed {
                tool: "yt-dlp",
                status: Some(1),
                stderr: "HTTP Error 429: Too Many Requests".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaExtractor for FakeExtractor {
    async fn fetch_metadata(
        &self,
        url: &str,
        egress: Option<&str>,
    ) -> Result<MediaMetadata, FetchError> {
        self.metadata_calls
            .lock()
            .unwrap()
            .push(egress.map(str::to_string));
        self.check(egress)?;

        let content_id = content_id_of(url);
        Ok(MediaMetadata {
            title: format!("Video {content_id}"),
            content_id,
            channel: Some("Test Channel".into()),
            description: None,
            duration_seconds: self.duration_seconds.or(Some(0.1)),
            filesize: None,
            filesize_approx: None,
        })
    }

    async fn fetch_media(
        &self,
        _url: &str,
        egress: Option<&str>,
        dest: &Path,
    ) -> Result<(), FetchError> {
        self.check(egress)?;
        self.media_calls.fetch_add(1, Ordering::SeqCst);

        let mut payload = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
        payload.resize(PAYLOAD_LEN, 0x55);
        tokio::fs::write(dest, payload).await?;
        Ok(())
    }
}

/// Transcoder that copies its input.
pub struct CopyTranscoder;

#[async_trait]
impl Transcoder for CopyTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        _codec: &str,
        _bitrate: &str,
    ) -> Result<(), FetchError> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

/// A fully wired process backed by fakes and temp directories.
pub struct TestApp {
    pub db: DatabaseConnection,
    pub config: Arc<AppConfig>,
    pub services: Services,
    pub extractor: Arc<FakeExtractor>,
    pub storage: Arc<LocalFileStorage>,
    pub scratch: TempDir,
    pub storage_dir: TempDir,
}

pub fn test_config(scratch: &Path, storage: &Path) -> AppConfig {
    let mut config = AppConfig {
        profile: "test".into(),
        database_url: "sqlite::memory:".into(),
        storage_dir: storage.to_path_buf(),
        public_base_url: "http://tubecast.test".into(),
        ..AppConfig::default()
    };
    config.dispatcher.worker_limit = 2;
    config.dispatcher.poll_interval_seconds = 1;
    config.dispatcher.poll_jitter_pct = 0.0;
    config.dispatcher.default_max_retries = 6;
    config.media.scratch_dir = scratch.to_path_buf();
    config.egress = EgressConfig {
        enabled: true,
        primary: "primary".into(),
        endpoints: [
            ("primary", "http://primary.proxy:8000"),
            ("backup_one", "http://one.proxy:8000"),
            ("backup_two", "http://two.proxy:8000"),
        ]
        .into_iter()
        .map(|(key, url)| (key.to_string(), url.to_string()))
        .collect(),
        tiers: vec![
            EgressTierConfig {
                threshold: 2,
                key: "backup_one".into(),
            },
            EgressTierConfig {
                threshold: 4,
                key: "backup_two".into(),
            },
        ],
    };
    config.webhooks = WebhookConfig {
        timeout_ms: 2_000,
        backoff_seconds: vec![0, 0],
    };
    config
}

impl TestApp {
    pub async fn new(extractor: FakeExtractor) -> Result<Self> {
        Self::with_config(extractor, |_| {}).await
    }

    pub async fn with_config(
        extractor: FakeExtractor,
        customize: impl FnOnce(&mut AppConfig),
    ) -> Result<Self> {
        let db = setup_test_db().await?;
        let scratch = TempDir::new()?;
        let storage_dir = TempDir::new()?;

        let mut config = test_config(scratch.path(), storage_dir.path());
        customize(&mut config);
        let config = Arc::new(config);

        let extractor = Arc::new(extractor);
        let media = Arc::new(MediaFetchClient::new(
            &config.media,
            extractor.clone(),
            Arc::new(CopyTranscoder),
        ));
        let storage = Arc::new(LocalFileStorage::new(
            storage_dir.path(),
            &config.public_base_url,
        ));
        let services = build_services(
            config.clone(),
            db.clone(),
            media,
            storage.clone() as Arc<dyn FileStorage>,
        )?;

        Ok(Self {
            db,
            config,
            services,
            extractor,
            storage,
            scratch,
            storage_dir,
        })
    }

    pub fn dispatcher(&self) -> &QueueDispatcher {
        &self.services.dispatcher
    }

    /// Opens a 30-day usage cycle for `user_id`.
    pub async fn open_cycle(&self, user_id: Uuid, limit_bytes: i64) -> Result<monthly_usage::Model> {
        let start = Utc::now().fixed_offset() - Duration::days(1);
        Ok(UsageRepository::new(self.db.clone())
            .open_cycle(user_id, limit_bytes, start, start + Duration::days(30))
            .await?)
    }

    /// Ticks and waits for every dispatched entry until a tick claims nothing.
    pub async fn run_until_idle(&self) -> Result<Vec<TickReport>> {
        let mut reports = Vec::new();
        for _ in 0..100 {
            let report = tick_and_wait(self.dispatcher()).await?;
            reports.push(report);
            if report.claimed == 0 {
                return Ok(reports);
            }
        }
        anyhow::bail!("queue did not drain")
    }

    pub fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

/// One tick, then waits for everything it dispatched.
pub async fn tick_and_wait(dispatcher: &QueueDispatcher) -> Result<TickReport> {
    let mut tasks = JoinSet::new();
    let report = dispatcher.tick(&mut tasks).await?;
    while let Some(joined) = tasks.join_next().await {
        joined?;
    }
    Ok(report)
}
