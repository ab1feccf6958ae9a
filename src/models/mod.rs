//! # Data Models
//!
//! SeaORM entities for every table tubecast persists, plus the small API
//! types shared across handlers.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod download;
pub mod item;
pub mod job;
pub mod monthly_usage;
pub mod podcast;
pub mod queue_entry;
pub mod record_status;
pub mod webhook;
pub mod webhook_event;

pub use download::Entity as Download;
pub use item::Entity as Item;
pub use job::Entity as Job;
pub use monthly_usage::Entity as MonthlyUsage;
pub use podcast::Entity as Podcast;
pub use queue_entry::{Entity as QueueEntry, QueueStatus, TargetCollection};
pub use record_status::RecordStatus;
pub use webhook::Entity as Webhook;
pub use webhook_event::{DeliveryStatus, Entity as WebhookEvent, WebhookEventKind};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "tubecast".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
