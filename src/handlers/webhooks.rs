//! # Webhook API Handlers

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::models::WebhookEventKind;
use crate::repositories::WebhookRepository;
use crate::server::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterWebhookRequest {
    #[schema(example = "https://hooks.example.com/tubecast")]
    pub url: String,
    /// Events to deliver; all events when omitted
    #[serde(default)]
    pub events: Vec<WebhookEventKind>,
    /// Enables `X-Tubecast-Signature` when set
    pub secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookInfo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    pub events: Vec<WebhookEventKind>,
    pub signed: bool,
    pub enabled: bool,
}

/// Register or replace a user's webhook
#[utoipa::path(
    put,
    path = "/api/v1/webhooks/{user_id}",
    params(("user_id" = Uuid, Path, description = "Owner of the webhook")),
    request_body = RegisterWebhookRequest,
    responses(
        (status = 200, description = "Webhook registered", body = WebhookInfo),
        (status = 400, description = "Invalid request", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn register_webhook(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    payload: Result<Json<RegisterWebhookRequest>, JsonRejection>,
) -> Result<Json<WebhookInfo>, ApiError> {
    let Json(request) = payload?;

    let valid_url = Url::parse(&request.url)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !valid_url {
        return Err(validation_error(
            "Invalid webhook",
            json!({ "url": "Must be an absolute http(s) URL" }),
        ));
    }

    let events = if request.events.is_empty() {
        vec![
            WebhookEventKind::Created,
            WebhookEventKind::Started,
            WebhookEventKind::Success,
            WebhookEventKind::Error,
        ]
    } else {
        request.events
    };
    let secret = request.secret.as_deref().filter(|secret| !secret.is_empty());

    let hook = WebhookRepository::new(state.db.clone())
        .upsert(user_id, &request.url, &events, secret)
        .await?;

    Ok(Json(WebhookInfo {
        id: hook.id,
        user_id: hook.user_id,
        url: hook.url,
        events,
        signed: hook.secret.is_some(),
        enabled: hook.enabled,
    }))
}
