//! # Repository Layer
//!
//! Repositories encapsulate SeaORM access per table. They return `DbErr` and
//! leave classification to the caller: the HTTP layer maps to `ApiError`,
//! the dispatcher and handlers to `JobError`.

pub mod download;
pub mod item;
pub mod job;
pub mod podcast;
pub mod queue;
pub mod usage;
pub mod webhook;

pub use download::DownloadRepository;
pub use item::ItemRepository;
pub use job::JobRepository;
pub use podcast::PodcastRepository;
pub use queue::{FailureDisposition, QueueRepository};
pub use usage::{UsageCharge, UsageRepository};
pub use webhook::WebhookRepository;
