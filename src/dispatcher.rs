//! # Queue Dispatcher
//!
//! Polls `queue_entries` for `PENDING` work, claims entries one at a time
//! with a transactional compare-and-set, and runs each claimed entry on its
//! collection's handler under a semaphore of `worker_limit` permits.
//!
//! Hanging entries (`PROCESSING` rows left behind by a crashed process) are
//! returned to `PENDING` by [`QueueDispatcher::recover`], which the server
//! calls once after binding. Every write made on behalf of a claim is fenced
//! by the claim's `worker_id`, so a worker that outlives a reset cannot
//! overwrite the state of whoever claimed the entry next. A handler that
//! panics counts as a failed attempt; its entry never stays `PROCESSING`.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use sea_orm::DbErr;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::models::queue_entry;
use crate::repositories::{FailureDisposition, QueueRepository};
use crate::workers::{DispatchContext, HandlerRegistry, JobError, JobHandler, JobOutcome};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue database error: {0}")]
    Database(#[from] DbErr),
}

/// What one poll did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Pending entries read
    pub fetched: usize,
    /// Entries claimed and dispatched
    pub claimed: usize,
    /// Entries another claimant took first
    pub conflicts: usize,
}

#[derive(Clone)]
pub struct QueueDispatcher {
    queue: QueueRepository,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl QueueDispatcher {
    pub fn new(
        queue: QueueRepository,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_limit as usize));
        Self {
            queue,
            registry,
            config,
            permits,
        }
    }

    pub fn worker_limit(&self) -> usize {
        self.config.worker_limit as usize
    }

    /// Returns every `PROCESSING` entry to `PENDING`. Run once at startup,
    /// before the first tick.
    #[instrument(skip_all)]
    pub async fn recover(&self) -> Result<u64, DispatchError> {
        let reset = self.queue.reset_hanging_entries().await?;
        counter!("queue_hanging_entries_reset_total").increment(reset);
        if reset > 0 {
            warn!(reset, "reset hanging queue entries");
        } else {
            debug!("no hanging queue entries");
        }
        Ok(reset)
    }

    /// Polls until `shutdown` fires, then waits for in-flight entries.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_limit = self.config.worker_limit,
            poll_interval_seconds = self.config.poll_interval_seconds,
            collections = ?self.registry.collections(),
            "starting queue dispatcher"
        );
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("queue dispatcher shutdown requested");
                    break;
                }
                _ = sleep(self.next_poll_delay()) => {
                    let tick_started = Instant::now();
                    match self.tick(&mut tasks).await {
                        Ok(report) => debug!(
                            fetched = report.fetched,
                            claimed = report.claimed,
                            conflicts = report.conflicts,
                            in_flight = tasks.len(),
                            "dispatcher tick finished"
                        ),
                        Err(err) => error!(error = ?err, "dispatcher tick failed"),
                    }
                    histogram!("queue_dispatch_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                    reap_finished(&mut tasks);
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight queue entries");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join_result(joined);
        }
        info!("queue dispatcher stopped");
    }

    fn next_poll_delay(&self) -> Duration {
        let base = Duration::from_secs(self.config.poll_interval_seconds);
        let jitter = self.config.poll_jitter_pct;
        if jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=jitter);
        base + base.mul_f64(factor)
    }

    /// Claims as many pending entries as there is capacity for and spawns
    /// them onto `tasks`.
    pub async fn tick(&self, tasks: &mut JoinSet<()>) -> Result<TickReport, DispatchError> {
        let mut report = TickReport::default();
        let worker_limit = self.config.worker_limit as u64;

        let processing = self.queue.count_processing().await?;
        if processing >= worker_limit {
            debug!(processing, worker_limit, "worker limit reached; skipping poll");
            return Ok(report);
        }

        let available = (worker_limit - processing).min(self.permits.available_permits() as u64);
        if available == 0 {
            return Ok(report);
        }

        let pending = self.queue.fetch_pending(available).await?;
        report.fetched = pending.len();

        for entry in pending {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };

            let worker_id = Uuid::new_v4().simple().to_string();
            let Some(claimed) = self.queue.claim(entry.id, &worker_id).await? else {
                report.conflicts += 1;
                counter!("queue_claim_conflicts_total").increment(1);
                debug!(queue_id = %entry.id, "entry claimed elsewhere");
                continue;
            };

            report.claimed += 1;
            counter!(
                "queue_entries_claimed_total",
                "collection" => claimed.target_collection.as_str()
            )
            .increment(1);

            let dispatcher = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                dispatcher.dispatch(claimed, worker_id).await;
            });
        }

        Ok(report)
    }

    #[instrument(
        skip_all,
        fields(
            queue_id = %entry.id,
            target_id = %entry.target_id,
            collection = %entry.target_collection,
            worker_id = %worker_id,
            retry_count = entry.retry_count,
        )
    )]
    async fn dispatch(&self, entry: queue_entry::Model, worker_id: String) {
        let started = Instant::now();

        let Some(handler) = self.registry.get(entry.target_collection) else {
            let message = format!("no handler registered for '{}'", entry.target_collection);
            error!("{message}");
            self.fail_terminal(&entry, &worker_id, &message, None).await;
            return;
        };

        let ctx = Arc::new(DispatchContext { entry, worker_id });
        let attempt = {
            let handler = handler.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { handler.process(&ctx).await }.instrument(Span::current()))
        };
        let result = match attempt.await {
            Ok(result) => result,
            Err(join_err) => Err(JobError::Aborted(describe_abort(join_err))),
        };

        match result {
            Ok(outcome) => self.handle_success(&ctx, &outcome).await,
            Err(err) => self.handle_failure(&ctx, handler.as_ref(), err).await,
        }

        histogram!("queue_entry_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
    }

    async fn handle_success(&self, ctx: &DispatchContext, outcome: &JobOutcome) {
        match self.queue.mark_completed(ctx.entry.id, &ctx.worker_id).await {
            Ok(true) => {
                counter!(
                    "queue_entries_completed_total",
                    "collection" => ctx.entry.target_collection.as_str()
                )
                .increment(1);
                info!(?outcome, "queue entry completed");
            }
            Ok(false) => warn!(?outcome, "entry no longer owned; completion not recorded"),
            Err(err) => error!(error = ?err, "failed to mark entry completed"),
        }
    }

    /// Retryable errors consume one unit of budget; exhausting it, or any
    /// non-retryable error, fails the entry and its target record.
    async fn handle_failure(&self, ctx: &DispatchContext, handler: &dyn JobHandler, err: JobError) {
        let message = err.to_string();

        if !err.is_retryable() {
            warn!(error = %message, "non-retryable failure");
            self.fail_terminal(&ctx.entry, &ctx.worker_id, &message, Some(handler))
                .await;
            return;
        }

        match self
            .queue
            .record_failure(&ctx.entry, &ctx.worker_id, &message)
            .await
        {
            Ok(Some(FailureDisposition::Retry { retry_count })) => {
                counter!("queue_entries_retried_total").increment(1);
                warn!(
                    error = %message,
                    next_retry_count = retry_count,
                    max_retries = ctx.entry.max_retries,
                    "attempt failed; entry returned to pending"
                );
            }
            Ok(Some(FailureDisposition::Exhausted { retry_count })) => {
                counter!("queue_entries_failed_total", "reason" => "exhausted").increment(1);
                error!(error = %message, retry_count, "retry budget exhausted");
                if let Err(db_err) = handler
                    .mark_target_failed(ctx.entry.target_id, &message)
                    .await
                {
                    error!(error = ?db_err, "failed to mark target record failed");
                }
            }
            Ok(None) => warn!(error = %message, "entry no longer owned; failure not recorded"),
            Err(db_err) => error!(error = ?db_err, "failed to record attempt failure"),
        }
    }

    async fn fail_terminal(
        &self,
        entry: &queue_entry::Model,
        worker_id: &str,
        message: &str,
        handler: Option<&dyn JobHandler>,
    ) {
        match self
            .queue
            .mark_failed_without_retry(entry.id, worker_id, message)
            .await
        {
            Ok(true) => {
                counter!("queue_entries_failed_total", "reason" => "terminal").increment(1);
                if let Some(handler) = handler {
                    if let Err(err) = handler.mark_target_failed(entry.target_id, message).await {
                        error!(error = ?err, "failed to mark target record failed");
                    }
                }
            }
            Ok(false) => warn!("entry no longer owned; failure not recorded"),
            Err(err) => error!(error = ?err, "failed to mark entry failed"),
        }
    }
}

fn describe_abort(err: JoinError) -> String {
    if !err.is_panic() {
        return "handler task was cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("handler panicked: {detail}"),
        None => "handler panicked".to_string(),
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        log_join_result(joined);
    }
}

fn log_join_result(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = ?err, "queue entry task aborted");
    }
}
