//! # Usage Repository
//!
//! Reads and updates the monthly usage ledger. A user's ledger rows form a
//! chain of billing cycles; when the newest one lapses, the next cycle is
//! opened with the same allowance and length.

use chrono::{Duration, Months, Utc};
use metrics::counter;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::models::monthly_usage::{ActiveModel, Column, Entity, Model};

/// Bytes owed by one finished target. Applied in the same transaction that
/// marks the target `SUCCESS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCharge {
    pub ledger_id: Uuid,
    pub bytes: i64,
}

#[derive(Clone)]
pub struct UsageRepository {
    db: DatabaseConnection,
}

impl UsageRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Opens a billing cycle for `user_id`.
    pub async fn open_cycle(
        &self,
        user_id: Uuid,
        limit_bytes: i64,
        cycle_start: DateTimeWithTimeZone,
        cycle_end: DateTimeWithTimeZone,
    ) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            usage_bytes: Set(0),
            limit_bytes: Set(limit_bytes),
            billing_cycle_start: Set(cycle_start),
            billing_cycle_end: Set(cycle_end),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    /// The ledger whose cycle has not ended yet, newest first.
    pub async fn current_for_user(&self, user_id: Uuid) -> Result<Option<Model>, DbErr> {
        let now = Utc::now().fixed_offset();
        Entity::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::BillingCycleEnd.gt(now))
            .order_by_desc(Column::BillingCycleStart)
            .order_by_desc(Column::CreatedAt)
            .one(&self.db)
            .await
    }

    /// Like [`current_for_user`](Self::current_for_user), but a user whose
    /// newest cycle has lapsed gets the next one opened on the spot.
    /// `None` only for users that never had a ledger.
    pub async fn current_or_rolled(&self, user_id: Uuid) -> Result<Option<Model>, DbErr> {
        if let Some(current) = self.current_for_user(user_id).await? {
            return Ok(Some(current));
        }
        match self.latest_for_user(user_id).await? {
            Some(lapsed) => self.roll_over(&lapsed).await.map(Some),
            None => Ok(None),
        }
    }

    /// Opens the next cycle for every user whose newest ledger has lapsed.
    /// Returns how many cycles were opened.
    #[instrument(skip(self))]
    pub async fn roll_over_expired(&self) -> Result<u64, DbErr> {
        let now = Utc::now().fixed_offset();
        let users: Vec<Uuid> = Entity::find()
            .select_only()
            .column(Column::UserId)
            .filter(Column::BillingCycleEnd.lte(now))
            .distinct()
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut opened = 0;
        for user_id in users {
            if self.current_for_user(user_id).await?.is_some() {
                continue;
            }
            if let Some(lapsed) = self.latest_for_user(user_id).await? {
                self.roll_over(&lapsed).await?;
                opened += 1;
            }
        }
        Ok(opened)
    }

    async fn latest_for_user(&self, user_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::BillingCycleEnd)
            .order_by_desc(Column::CreatedAt)
            .one(&self.db)
            .await
    }

    async fn roll_over(&self, lapsed: &Model) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let (start, end) = next_cycle(lapsed.billing_cycle_start, lapsed.billing_cycle_end, now);

        match self
            .open_cycle(lapsed.user_id, lapsed.limit_bytes, start, end)
            .await
        {
            Ok(opened) => {
                counter!("usage_cycles_rolled_over_total").increment(1);
                info!(
                    user_id = %lapsed.user_id,
                    ledger_id = %opened.id,
                    cycle_start = %start,
                    cycle_end = %end,
                    "usage cycle rolled over"
                );
                Ok(opened)
            }
            // Another worker opened the same cycle first.
            Err(err) if is_unique_violation(&err) => {
                match self.current_for_user(lapsed.user_id).await? {
                    Some(current) => Ok(current),
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn find(&self, ledger_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(ledger_id).one(&self.db).await
    }

    /// Adds `delta` bytes in a single `usage_bytes = usage_bytes + delta`
    /// statement, so concurrent workers never lose each other's increments.
    pub async fn add_usage(&self, ledger_id: Uuid, delta: i64) -> Result<(), DbErr> {
        self.charge_with(
            &self.db,
            UsageCharge {
                ledger_id,
                bytes: delta,
            },
        )
        .await
    }

    /// Applies `charge` on `conn`, typically an open transaction.
    pub async fn charge_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        charge: UsageCharge,
    ) -> Result<(), DbErr> {
        if charge.bytes == 0 {
            return Ok(());
        }

        let result = Entity::update_many()
            .col_expr(
                Column::UsageBytes,
                Expr::col(Column::UsageBytes).add(charge.bytes),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(charge.ledger_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(DbErr::RecordNotFound(format!(
                "monthly_usage {}",
                charge.ledger_id
            )));
        }
        Ok(())
    }
}

/// Bounds of the cycle following `[start, end)`: same length, advanced past
/// any whole cycles that lapsed unused so the result contains `now`.
pub fn next_cycle(
    start: DateTimeWithTimeZone,
    end: DateTimeWithTimeZone,
    now: DateTimeWithTimeZone,
) -> (DateTimeWithTimeZone, DateTimeWithTimeZone) {
    let length = end - start;
    let advance = |from: DateTimeWithTimeZone| {
        if length > Duration::zero() {
            from + length
        } else {
            from.checked_add_months(Months::new(1))
                .unwrap_or(from + Duration::days(30))
        }
    };

    let mut next_start = end;
    let mut next_end = advance(next_start);
    while next_end <= now {
        next_start = next_end;
        next_end = advance(next_start);
    }
    (next_start, next_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn repo() -> UsageRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        UsageRepository::new(db)
    }

    #[tokio::test]
    async fn current_cycle_ignores_expired_ledgers() {
        let repo = repo().await;
        let user = Uuid::new_v4();
        let now = Utc::now().fixed_offset();

        repo.open_cycle(user, 10, now - Duration::days(60), now - Duration::days(30))
            .await
            .unwrap();
        let current = repo
            .open_cycle(user, 20, now - Duration::days(1), now + Duration::days(29))
            .await
            .unwrap();

        let found = repo.current_for_user(user).await.unwrap().unwrap();
        assert_eq!(found.id, current.id);
        assert!(repo.current_for_user(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn increments_accumulate() {
        let repo = repo().await;
        let now = Utc::now().fixed_offset();
        let ledger = repo
            .open_cycle(Uuid::new_v4(), 1000, now, now + Duration::days(30))
            .await
            .unwrap();

        repo.add_usage(ledger.id, 100).await.unwrap();
        repo.add_usage(ledger.id, 250).await.unwrap();

        let reloaded = repo.find(ledger.id).await.unwrap().unwrap();
        assert_eq!(reloaded.usage_bytes, 350);
        assert!(repo.add_usage(Uuid::new_v4(), 1).await.is_err());
    }

    #[tokio::test]
    async fn lapsed_cycle_rolls_over_on_lookup() {
        let repo = repo().await;
        let user = Uuid::new_v4();
        let now = Utc::now().fixed_offset();
        let lapsed = repo
            .open_cycle(user, 500, now - Duration::days(31), now - Duration::minutes(1))
            .await
            .unwrap();
        repo.add_usage(lapsed.id, 400).await.unwrap();

        let rolled = repo.current_or_rolled(user).await.unwrap().unwrap();
        assert_ne!(rolled.id, lapsed.id);
        assert_eq!(rolled.usage_bytes, 0);
        assert_eq!(rolled.limit_bytes, 500);
        assert_eq!(rolled.billing_cycle_start, lapsed.billing_cycle_end);
        assert!(rolled.billing_cycle_end > now);

        // The second lookup finds the cycle that was just opened.
        let again = repo.current_or_rolled(user).await.unwrap().unwrap();
        assert_eq!(again.id, rolled.id);
        assert!(repo.current_or_rolled(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_opens_one_cycle_per_lapsed_user() {
        let repo = repo().await;
        let now = Utc::now().fixed_offset();
        let lapsed_user = Uuid::new_v4();
        let active_user = Uuid::new_v4();

        repo.open_cycle(lapsed_user, 10, now - Duration::days(90), now - Duration::days(60))
            .await
            .unwrap();
        repo.open_cycle(active_user, 10, now - Duration::days(45), now - Duration::days(15))
            .await
            .unwrap();
        repo.open_cycle(active_user, 10, now - Duration::days(15), now + Duration::days(15))
            .await
            .unwrap();

        assert_eq!(repo.roll_over_expired().await.unwrap(), 1);
        assert_eq!(repo.roll_over_expired().await.unwrap(), 0);

        let current = repo.current_for_user(lapsed_user).await.unwrap().unwrap();
        assert!(current.billing_cycle_start <= now);
        assert!(current.billing_cycle_end > now);
    }

    #[test]
    fn next_cycle_skips_whole_lapsed_cycles() {
        let now = Utc::now().fixed_offset();
        let start = now - Duration::days(100);
        let end = start + Duration::days(30);

        let (next_start, next_end) = next_cycle(start, end, now);
        assert_eq!(next_start, start + Duration::days(90));
        assert_eq!(next_end, start + Duration::days(120));
    }
}
