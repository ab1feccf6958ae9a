//! Job lifecycle notifications.
//!
//! Each user may register one webhook. Deliveries are logged in
//! `webhook_events` and retried in the background; a failing receiver never
//! affects job processing.

use std::time::Duration;

use hmac::{Hmac, Mac};
use metrics::counter;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::models::{DeliveryStatus, WebhookEventKind, job, webhook};
use crate::repositories::WebhookRepository;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the request body.
pub const SIGNATURE_HEADER: &str = "X-Tubecast-Signature";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to build webhook http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: WebhookEventKind,
    pub data: WebhookPayloadData,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayloadData {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Clone)]
pub struct WebhookNotifier {
    repo: WebhookRepository,
    client: reqwest::Client,
    backoffs: Vec<Duration>,
}

impl WebhookNotifier {
    pub fn new(repo: WebhookRepository, config: &WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!("tubecast/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            repo,
            client,
            backoffs: config
                .backoff_seconds
                .iter()
                .map(|seconds| Duration::from_secs(*seconds))
                .collect(),
        })
    }

    /// Notifies the job owner's webhook about `event`.
    ///
    /// Returns the handle of the background delivery, or `None` when nothing
    /// is sent (no webhook, disabled, not subscribed, or the lookup failed).
    pub async fn send(
        &self,
        job: &job::Model,
        event: WebhookEventKind,
        error: Option<&str>,
    ) -> Option<JoinHandle<DeliveryStatus>> {
        let hook = match self.repo.find_for_user(job.user_id).await {
            Ok(Some(hook)) if hook.enabled && hook.subscribes_to(event) => hook,
            Ok(_) => return None,
            Err(err) => {
                warn!(error = ?err, job_id = %job.id, "webhook lookup failed");
                return None;
            }
        };

        let record = match self.repo.record_event(hook.id, job.id, event).await {
            Ok(record) => record,
            Err(err) => {
                warn!(error = ?err, job_id = %job.id, "failed to log webhook event");
                return None;
            }
        };

        let payload = WebhookPayload {
            event,
            data: WebhookPayloadData {
                job_id: job.id,
                batch_id: job.batch_id,
                error: error.map(str::to_string),
            },
        };

        let notifier = self.clone();
        Some(tokio::spawn(async move {
            notifier.deliver(hook, record.id, payload).await
        }))
    }

    async fn deliver(
        &self,
        hook: webhook::Model,
        event_id: Uuid,
        payload: WebhookPayload,
    ) -> DeliveryStatus {
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                self.finish(event_id, 0, DeliveryStatus::Failed, Some(err.to_string()))
                    .await;
                return DeliveryStatus::Failed;
            }
        };
        let signature = hook
            .secret
            .as_deref()
            .map(|secret| format!("sha256={}", sign(secret, &body)));

        let max_attempts = self.backoffs.len() + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoffs[attempt - 2]).await;
            }

            let mut request = self
                .client
                .post(&hook.url)
                .header("content-type", "application/json")
                .body(body.clone());
            if let Some(signature) = &signature {
                request = request.header(SIGNATURE_HEADER, signature);
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    self.finish(event_id, attempt as i32, DeliveryStatus::Success, None)
                        .await;
                    counter!("webhook_deliveries_total", "outcome" => "success").increment(1);
                    info!(
                        event = payload.event.as_str(),
                        job_id = %payload.data.job_id,
                        attempt,
                        "webhook delivered"
                    );
                    return DeliveryStatus::Success;
                }
                Ok(response) => format!("receiver responded with {}", response.status()),
                Err(err) => err.to_string(),
            };

            debug!(
                event = payload.event.as_str(),
                attempt,
                error = %error,
                "webhook attempt failed"
            );
            let status = if attempt == max_attempts {
                DeliveryStatus::Failed
            } else {
                DeliveryStatus::Active
            };
            self.finish(event_id, attempt as i32, status, Some(error.clone()))
                .await;
            last_error = Some(error);
        }

        counter!("webhook_deliveries_total", "outcome" => "failed").increment(1);
        warn!(
            event = payload.event.as_str(),
            job_id = %payload.data.job_id,
            error = ?last_error,
            "webhook delivery gave up"
        );
        DeliveryStatus::Failed
    }

    async fn finish(
        &self,
        event_id: Uuid,
        attempts: i32,
        status: DeliveryStatus,
        error: Option<String>,
    ) {
        if let Err(err) = self
            .repo
            .record_attempt(event_id, attempts, status, error)
            .await
        {
            warn!(error = ?err, event_id = %event_id, "failed to record webhook attempt");
        }
    }
}
