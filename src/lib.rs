//! # tubecast
//!
//! Converts video URLs into stored MP3 audio. Work is queued in the
//! database and processed by a polling dispatcher with a bounded worker
//! pool, retry budgets, and egress rotation across proxy tiers. Finished
//! podcast items are published through a JSON feed manifest.

pub mod billing;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod egress;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod media;
pub mod models;
pub mod repositories;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod webhooks;
pub mod workers;
pub use migration;
