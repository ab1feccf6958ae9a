//! End-to-end processing through the real handlers with fake media tools.

mod test_utils;

use chrono::{Duration, Utc};
use sea_orm::{ConnectionTrait, EntityTrait};
use uuid::Uuid;

use test_utils::{FakeExtractor, PAYLOAD_LEN, TestApp, tick_and_wait, video_url};
use tubecast::feed::{FeedManifest, feed_key};
use tubecast::models::{Download, QueueStatus, RecordStatus, TargetCollection};
use tubecast::repositories::{
    ItemRepository, JobRepository, PodcastRepository, QueueRepository, UsageRepository,
};

const GIB: i64 = 1024 * 1024 * 1024;

fn queue(app: &TestApp) -> QueueRepository {
    app.services.state.queue.clone()
}

#[tokio::test]
async fn job_is_downloaded_stored_and_charged() {
    let app = TestApp::new(FakeExtractor::default()).await.unwrap();
    let user = Uuid::new_v4();
    let cycle = app.open_cycle(user, GIB).await.unwrap();

    let jobs = JobRepository::new(app.db.clone());
    let (batch_id, created) = jobs
        .create_batch(&queue(&app), user, &[video_url("dQw4w9WgXcQ")])
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let (job, download) = jobs
        .find_with_download(created[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.batch_id, batch_id);
    assert_eq!(job.status, RecordStatus::Success);
    assert_eq!(job.title.as_deref(), Some("Video dQw4w9WgXcQ"));

    let download = download.unwrap();
    assert_eq!(download.content_id, "dQw4w9WgXcQ");
    assert_eq!(download.size_bytes, PAYLOAD_LEN as i64);
    assert!(app.storage_dir.path().join(&download.file_key).exists());

    let usage = UsageRepository::new(app.db.clone())
        .find(cycle.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.usage_bytes, PAYLOAD_LEN as i64);

    let entry = queue(&app)
        .find_for_target(TargetCollection::Jobs, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::Completed);
    assert_eq!(entry.last_proxy.as_deref(), Some("primary"));
    assert!(app.scratch_is_empty());
}

#[tokio::test]
async fn failing_egress_escalates_through_tiers() {
    let extractor = FakeExtractor::failing_through(&[
        Some("http://primary.proxy:8000"),
        Some("http://one.proxy:8000"),
    ]);
    let app = TestApp::new(extractor).await.unwrap();
    let user = Uuid::new_v4();
    app.open_cycle(user, GIB).await.unwrap();

    let jobs = JobRepository::new(app.db.clone());
    let (_, created) = jobs
        .create_batch(&queue(&app), user, &[video_url("aaaaaaaaaaa")])
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let job = jobs.find(created[0].id).await.unwrap().unwrap();
    assert_eq!(job.status, RecordStatus::Success);

    let entry = queue(&app)
        .find_for_target(TargetCollection::Jobs, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::Completed);
    assert_eq!(entry.retry_count, 4);
    assert_eq!(entry.last_proxy.as_deref(), Some("backup_two"));

    let used: Vec<_> = app
        .extractor
        .endpoints_used()
        .into_iter()
        .map(|endpoint| endpoint.unwrap_or_default())
        .collect();
    assert_eq!(
        used,
        vec![
            "http://primary.proxy:8000",
            "http://primary.proxy:8000",
            "http://one.proxy:8000",
            "http://one.proxy:8000",
            "http://two.proxy:8000",
        ]
    );
}

#[tokio::test]
async fn exhausted_retries_mark_the_job_failed() {
    let extractor = FakeExtractor {
        fail_everything: true,
        ..FakeExtractor::default()
    };
    let app = TestApp::new(extractor).await.unwrap();
    let user = Uuid::new_v4();
    app.open_cycle(user, GIB).await.unwrap();

    let jobs = JobRepository::new(app.db.clone());
    let (_, created) = jobs
        .create_batch(&queue(&app), user, &[video_url("bbbbbbbbbbb")])
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let job = jobs.find(created[0].id).await.unwrap().unwrap();
    assert_eq!(job.status, RecordStatus::Error);
    assert!(job.error.unwrap().contains("429"));

    let entry = queue(&app)
        .find_for_target(TargetCollection::Jobs, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.retry_count, entry.max_retries);
    assert_eq!(app.extractor.endpoints_used().len(), 6);
}

#[tokio::test]
async fn same_content_is_downloaded_once() {
    let app = TestApp::with_config(FakeExtractor::default(), |config| {
        config.dispatcher.worker_limit = 1;
    })
    .await
    .unwrap();
    let user = Uuid::new_v4();
    let cycle = app.open_cycle(user, GIB).await.unwrap();

    let jobs = JobRepository::new(app.db.clone());
    let (_, created) = jobs
        .create_batch(
            &queue(&app),
            user,
            &[
                video_url("ccccccccccc"),
                "https://youtu.be/ccccccccccc".to_string(),
            ],
        )
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let first = jobs.find(created[0].id).await.unwrap().unwrap();
    let second = jobs.find(created[1].id).await.unwrap().unwrap();
    assert_eq!(first.status, RecordStatus::Success);
    assert_eq!(second.status, RecordStatus::Success);
    assert_eq!(first.download_id, second.download_id);

    assert_eq!(Download::find().all(&app.db).await.unwrap().len(), 1);
    assert_eq!(app.extractor.downloads(), 1);

    // Reuse is still charged
    let usage = UsageRepository::new(app.db.clone())
        .find(cycle.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.usage_bytes, 2 * PAYLOAD_LEN as i64);
}

#[tokio::test]
async fn quota_exceeded_is_terminal_and_free() {
    let extractor = FakeExtractor {
        duration_seconds: Some(3600.0),
        ..FakeExtractor::default()
    };
    let app = TestApp::new(extractor).await.unwrap();
    let user = Uuid::new_v4();
    let cycle = app.open_cycle(user, 1024 * 1024).await.unwrap();

    let jobs = JobRepository::new(app.db.clone());
    let (_, created) = jobs
        .create_batch(&queue(&app), user, &[video_url("ddddddddddd")])
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let job = jobs.find(created[0].id).await.unwrap().unwrap();
    assert_eq!(job.status, RecordStatus::Error);
    assert!(job.error.unwrap().starts_with("Monthly download limit reached"));

    let entry = queue(&app)
        .find_for_target(TargetCollection::Jobs, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::Completed);
    assert_eq!(entry.retry_count, 0);

    let usage = UsageRepository::new(app.db.clone())
        .find(cycle.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.usage_bytes, 0);
    assert_eq!(app.extractor.downloads(), 0);
}

#[tokio::test]
async fn missing_usage_cycle_fails_without_retries() {
    let app = TestApp::new(FakeExtractor::default()).await.unwrap();
    let user = Uuid::new_v4();

    let jobs = JobRepository::new(app.db.clone());
    let (_, created) = jobs
        .create_batch(&queue(&app), user, &[video_url("eeeeeeeeeee")])
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let job = jobs.find(created[0].id).await.unwrap().unwrap();
    assert_eq!(job.status, RecordStatus::Error);
    assert!(job.error.unwrap().contains("no active usage cycle"));

    let entry = queue(&app)
        .find_for_target(TargetCollection::Jobs, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.retry_count, 0);
    assert!(app.extractor.endpoints_used().is_empty());
}

#[tokio::test]
async fn lapsed_usage_cycle_rolls_over_for_the_job() {
    let app = TestApp::new(FakeExtractor::default()).await.unwrap();
    let user = Uuid::new_v4();
    let usage = UsageRepository::new(app.db.clone());
    let now = Utc::now().fixed_offset();
    let lapsed = usage
        .open_cycle(user, GIB, now - Duration::days(31), now - Duration::minutes(1))
        .await
        .unwrap();

    let jobs = JobRepository::new(app.db.clone());
    let (_, created) = jobs
        .create_batch(&queue(&app), user, &[video_url("kkkkkkkkkkk")])
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let job = jobs.find(created[0].id).await.unwrap().unwrap();
    assert_eq!(job.status, RecordStatus::Success);

    let current = usage.current_for_user(user).await.unwrap().unwrap();
    assert_ne!(current.id, lapsed.id);
    assert_eq!(current.limit_bytes, GIB);
    assert_eq!(current.usage_bytes, PAYLOAD_LEN as i64);
    let lapsed = usage.find(lapsed.id).await.unwrap().unwrap();
    assert_eq!(lapsed.usage_bytes, 0);
}

#[tokio::test]
async fn failed_success_write_does_not_charge_twice() {
    let app = TestApp::new(FakeExtractor::default()).await.unwrap();
    let user = Uuid::new_v4();
    let cycle = app.open_cycle(user, GIB).await.unwrap();
    let usage = UsageRepository::new(app.db.clone());

    app.db
        .execute_unprepared(
            "CREATE TRIGGER refuse_job_success BEFORE UPDATE OF status ON jobs \
             WHEN NEW.status = 'SUCCESS' \
             BEGIN SELECT RAISE(ABORT, 'write refused'); END;",
        )
        .await
        .unwrap();

    let jobs = JobRepository::new(app.db.clone());
    let (_, created) = jobs
        .create_batch(&queue(&app), user, &[video_url("mmmmmmmmmmm")])
        .await
        .unwrap();

    tick_and_wait(app.dispatcher()).await.unwrap();

    let job = jobs.find(created[0].id).await.unwrap().unwrap();
    assert_ne!(job.status, RecordStatus::Success);
    let entry = queue(&app)
        .find_for_target(TargetCollection::Jobs, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.retry_count, 1);
    assert!(entry.last_error.unwrap().contains("write refused"));
    assert_eq!(usage.find(cycle.id).await.unwrap().unwrap().usage_bytes, 0);

    app.db
        .execute_unprepared("DROP TRIGGER refuse_job_success")
        .await
        .unwrap();
    app.run_until_idle().await.unwrap();

    let job = jobs.find(created[0].id).await.unwrap().unwrap();
    assert_eq!(job.status, RecordStatus::Success);
    assert_eq!(
        usage.find(cycle.id).await.unwrap().unwrap().usage_bytes,
        PAYLOAD_LEN as i64
    );
    assert_eq!(app.extractor.downloads(), 1);
}

#[tokio::test]
async fn finished_item_publishes_the_podcast_feed() {
    let app = TestApp::new(FakeExtractor::default()).await.unwrap();
    let user = Uuid::new_v4();
    app.open_cycle(user, GIB).await.unwrap();

    let podcasts = PodcastRepository::new(app.db.clone());
    let items = ItemRepository::new(app.db.clone());
    let podcast = podcasts.create(user, "Listening list", None).await.unwrap();
    let item = items
        .create(&queue(&app), user, podcast.id, &video_url("fffffffffff"))
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let item = items.find(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, RecordStatus::Success);
    assert!(item.download_id.is_some());

    let podcast = podcasts.find(podcast.id).await.unwrap().unwrap();
    assert_eq!(podcast.feed_key.as_deref(), Some(feed_key(podcast.id).as_str()));

    let raw = std::fs::read(app.storage_dir.path().join(feed_key(podcast.id))).unwrap();
    let manifest: FeedManifest = serde_json::from_slice(&raw).unwrap();
    assert_eq!(manifest.episodes.len(), 1);
    assert_eq!(manifest.episodes[0].title, "Video fffffffffff");
    assert!(
        manifest.episodes[0]
            .audio_url
            .starts_with("http://tubecast.test/api/files/audio/")
    );
}

#[tokio::test]
async fn item_of_deleted_podcast_fails_terminally() {
    let app = TestApp::new(FakeExtractor::default()).await.unwrap();
    let user = Uuid::new_v4();
    app.open_cycle(user, GIB).await.unwrap();

    let items = ItemRepository::new(app.db.clone());
    let item = items
        .create(&queue(&app), user, Uuid::new_v4(), &video_url("ggggggggggg"))
        .await
        .unwrap();

    app.run_until_idle().await.unwrap();

    let item = items.find(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, RecordStatus::Error);
    assert!(item.error.unwrap().contains("podcast"));
}
