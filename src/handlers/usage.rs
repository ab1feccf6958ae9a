//! # Usage API Handlers
//!
//! Opens monthly usage cycles; every download is charged against the
//! caller's current cycle.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::models::monthly_usage;
use crate::repositories::UsageRepository;
use crate::server::AppState;

const DEFAULT_CYCLE_DAYS: i64 = 30;

#[derive(Debug, Deserialize, ToSchema)]
pub struct OpenCycleRequest {
    pub user_id: Uuid,
    /// Bytes the user may download during the cycle
    #[schema(example = 1073741824)]
    pub limit_bytes: i64,
    /// Cycle length in days (default 30)
    pub cycle_days: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UsageCycleInfo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub usage_bytes: i64,
    pub limit_bytes: i64,
    #[schema(value_type = String)]
    pub billing_cycle_start: DateTimeWithTimeZone,
    #[schema(value_type = String)]
    pub billing_cycle_end: DateTimeWithTimeZone,
}

impl From<monthly_usage::Model> for UsageCycleInfo {
    fn from(model: monthly_usage::Model) -> Self {
        Self {
            id: model.id,
            user_id: model.user_id,
            usage_bytes: model.usage_bytes,
            limit_bytes: model.limit_bytes,
            billing_cycle_start: model.billing_cycle_start,
            billing_cycle_end: model.billing_cycle_end,
        }
    }
}

/// Open a usage cycle starting now
#[utoipa::path(
    post,
    path = "/api/v1/usage",
    request_body = OpenCycleRequest,
    responses(
        (status = 201, description = "Usage cycle opened", body = UsageCycleInfo),
        (status = 400, description = "Invalid request", body = ApiError)
    ),
    tag = "usage"
)]
pub async fn open_cycle(
    State(state): State<AppState>,
    payload: Result<Json<OpenCycleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UsageCycleInfo>), ApiError> {
    let Json(request) = payload?;
    let cycle_days = request.cycle_days.unwrap_or(DEFAULT_CYCLE_DAYS);

    if request.limit_bytes < 0 {
        return Err(validation_error(
            "Invalid usage cycle",
            json!({ "limit_bytes": "Must not be negative" }),
        ));
    }
    if !(1..=366).contains(&cycle_days) {
        return Err(validation_error(
            "Invalid usage cycle",
            json!({ "cycle_days": "Must be between 1 and 366" }),
        ));
    }

    let start = Utc::now().fixed_offset();
    let end = start + Duration::days(cycle_days);
    let cycle = UsageRepository::new(state.db.clone())
        .open_cycle(request.user_id, request.limit_bytes, start, end)
        .await?;

    Ok((StatusCode::CREATED, Json(cycle.into())))
}
