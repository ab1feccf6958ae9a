//! # Billing Cycle Rollover
//!
//! Periodically opens the next usage cycle for users whose newest ledger
//! has lapsed. Workers also roll a lapsed cycle over on demand, so the sweep
//! only keeps idle users' ledgers current.

use std::time::Duration;

use metrics::counter;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::repositories::UsageRepository;

#[derive(Clone)]
pub struct UsageRollover {
    usage: UsageRepository,
    interval: Duration,
}

impl UsageRollover {
    pub fn new(usage: UsageRepository, interval_seconds: u64) -> Self {
        Self {
            usage,
            interval: Duration::from_secs(interval_seconds),
        }
    }

    /// One sweep. Errors are logged; the next sweep tries again.
    pub async fn sweep(&self) -> u64 {
        match self.usage.roll_over_expired().await {
            Ok(opened) => {
                if opened > 0 {
                    info!(opened, "opened usage cycles for lapsed ledgers");
                } else {
                    debug!("no lapsed usage ledgers");
                }
                opened
            }
            Err(err) => {
                counter!("usage_rollover_failures_total").increment(1);
                error!(error = ?err, "usage cycle rollover failed");
                0
            }
        }
    }

    /// Sweeps immediately, then every interval until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_seconds = self.interval.as_secs(),
            "starting usage rollover"
        );
        self.sweep().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }
        info!("usage rollover stopped");
    }
}
