//! Database migrations for tubecast.
//!
//! Tables are created one per migration in dependency order; the queue table
//! comes last because it references rows of the `jobs` and `items` collections
//! by id only.

pub use sea_orm_migration::prelude::*;

mod m2025_10_01_000100_create_podcasts;
mod m2025_10_01_000200_create_downloads;
mod m2025_10_01_000300_create_jobs;
mod m2025_10_01_000400_create_items;
mod m2025_10_01_000500_create_monthly_usage;
mod m2025_10_01_000600_create_webhooks;
mod m2025_10_01_000700_create_queue_entries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_10_01_000100_create_podcasts::Migration),
            Box::new(m2025_10_01_000200_create_downloads::Migration),
            Box::new(m2025_10_01_000300_create_jobs::Migration),
            Box::new(m2025_10_01_000400_create_items::Migration),
            Box::new(m2025_10_01_000500_create_monthly_usage::Migration),
            Box::new(m2025_10_01_000600_create_webhooks::Migration),
            Box::new(m2025_10_01_000700_create_queue_entries::Migration),
        ]
    }
}
