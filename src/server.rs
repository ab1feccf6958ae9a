//! # Server Configuration
//!
//! Router, shared state, and process lifecycle for the tubecast API.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::billing::UsageRollover;
use crate::config::AppConfig;
use crate::dispatcher::QueueDispatcher;
use crate::egress::EgressPolicy;
use crate::feed::{FeedPublisher, ManifestFeedPublisher};
use crate::handlers;
use crate::media::MediaFetchClient;
use crate::repositories::{
    DownloadRepository, ItemRepository, JobRepository, PodcastRepository, QueueRepository,
    UsageRepository, WebhookRepository,
};
use crate::storage::{FileStorage, LocalFileStorage};
use crate::telemetry::{self, TRACE_ID_HEADER, TraceContext};
use crate::webhooks::{WebhookError, WebhookNotifier};
use crate::workers::{DownloadPipeline, HandlerRegistry, ItemsHandler, JobsHandler};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub queue: QueueRepository,
    pub notifier: WebhookNotifier,
    pub storage: Arc<dyn FileStorage>,
}

/// Everything a running process needs: API state plus the dispatcher.
pub struct Services {
    pub state: AppState,
    pub dispatcher: QueueDispatcher,
}

/// Wires repositories, handlers, and the dispatcher around `db`.
pub fn build_services(
    config: Arc<AppConfig>,
    db: DatabaseConnection,
    media: Arc<MediaFetchClient>,
    storage: Arc<dyn FileStorage>,
) -> Result<Services, WebhookError> {
    let queue = QueueRepository::new(db.clone(), config.dispatcher.default_max_retries);
    let notifier = WebhookNotifier::new(WebhookRepository::new(db.clone()), &config.webhooks)?;
    let podcasts = PodcastRepository::new(db.clone());
    let items = ItemRepository::new(db.clone());

    let pipeline = DownloadPipeline::new(
        queue.clone(),
        UsageRepository::new(db.clone()),
        DownloadRepository::new(db.clone()),
        media,
        storage.clone(),
        Arc::new(EgressPolicy::from_config(&config.egress)),
    );
    let feed: Arc<dyn FeedPublisher> = Arc::new(ManifestFeedPublisher::new(
        podcasts.clone(),
        items.clone(),
        storage.clone(),
    ));

    let registry = HandlerRegistry::new()
        .with(Arc::new(JobsHandler::new(
            JobRepository::new(db.clone()),
            pipeline.clone(),
            notifier.clone(),
        )))
        .with(Arc::new(ItemsHandler::new(items, podcasts, pipeline, feed)));

    let dispatcher = QueueDispatcher::new(
        queue.clone(),
        Arc::new(registry),
        config.dispatcher.clone(),
    );

    Ok(Services {
        state: AppState {
            config,
            db,
            queue,
            notifier,
            storage,
        },
        dispatcher,
    })
}

/// Scopes a trace id to the request and echoes it on the response.
async fn trace_context(request: Request, next: Next) -> Response {
    let context = TraceContext::from_incoming(
        request
            .headers()
            .get(TRACE_ID_HEADER)
            .and_then(|value| value.to_str().ok()),
    );
    let trace_id = context.trace_id.clone();

    let mut response = telemetry::with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let files = ServeDir::new(&state.config.storage_dir);

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/api/v1/jobs", post(handlers::jobs::create_jobs))
        .route("/api/v1/jobs/{job_id}", get(handlers::jobs::get_job))
        .route("/api/v1/batches/{batch_id}", get(handlers::jobs::get_batch))
        .route("/api/v1/podcasts", post(handlers::podcasts::create_podcast))
        .route(
            "/api/v1/podcasts/{podcast_id}",
            get(handlers::podcasts::get_podcast),
        )
        .route(
            "/api/v1/podcasts/{podcast_id}/items",
            post(handlers::podcasts::create_item),
        )
        .route("/api/v1/usage", post(handlers::usage::open_cycle))
        .route(
            "/api/v1/webhooks/{user_id}",
            put(handlers::webhooks::register_webhook),
        )
        .nest_service("/api/files", files)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = ?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Serves the API and runs the queue dispatcher and usage rollover until
/// ctrl-c.
///
/// Hanging-entry recovery runs once, after the listener is bound and before
/// the dispatcher's first tick.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let addr = config.bind_addr().context("invalid server address")?;

    let media = Arc::new(MediaFetchClient::from_config(&config.media));
    let storage: Arc<dyn FileStorage> = Arc::new(LocalFileStorage::new(
        &config.storage_dir,
        &config.public_base_url,
    ));
    let rollover = UsageRollover::new(
        UsageRepository::new(db.clone()),
        config.usage_rollover_interval_seconds,
    );
    let Services { state, dispatcher } = build_services(config.clone(), db, media, storage)?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "server listening");

    dispatcher.recover().await?;

    let shutdown = CancellationToken::new();
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown.clone()));
    let rollover_task = tokio::spawn(rollover.run(shutdown.clone()));

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    if let Err(err) = dispatcher_task.await {
        error!(error = ?err, "queue dispatcher task failed");
    }
    if let Err(err) = rollover_task.await {
        error!(error = ?err, "usage rollover task failed");
    }

    served?;
    info!("server stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::jobs::create_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::get_batch,
        crate::handlers::podcasts::create_podcast,
        crate::handlers::podcasts::get_podcast,
        crate::handlers::podcasts::create_item,
        crate::handlers::usage::open_cycle,
        crate::handlers::webhooks::register_webhook,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::RecordStatus,
            crate::models::WebhookEventKind,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::jobs::CreateJobsRequest,
            crate::handlers::jobs::CreateJobsResponse,
            crate::handlers::jobs::JobInfo,
            crate::handlers::jobs::DownloadInfo,
            crate::handlers::jobs::BatchResponse,
            crate::handlers::jobs::BatchCounts,
            crate::handlers::podcasts::CreatePodcastRequest,
            crate::handlers::podcasts::PodcastInfo,
            crate::handlers::podcasts::CreateItemRequest,
            crate::handlers::podcasts::ItemInfo,
            crate::handlers::usage::OpenCycleRequest,
            crate::handlers::usage::UsageCycleInfo,
            crate::handlers::webhooks::RegisterWebhookRequest,
            crate::handlers::webhooks::WebhookInfo,
        )
    ),
    info(
        title = "tubecast API",
        description = "Turns video URLs into stored audio and podcast feeds",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
