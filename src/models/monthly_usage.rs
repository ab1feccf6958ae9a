//! MonthlyUsage entity model: the per-user, per-billing-cycle usage ledger.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "monthly_usage")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    /// Bytes consumed in this cycle
    pub usage_bytes: i64,

    /// Allowance for this cycle
    pub limit_bytes: i64,

    pub billing_cycle_start: DateTimeWithTimeZone,

    /// The ledger is current while this lies in the future
    pub billing_cycle_end: DateTimeWithTimeZone,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Whether consuming `additional` more bytes would exceed the allowance.
    /// A ledger already over its limit refuses any work.
    pub fn would_exceed(&self, additional: i64) -> bool {
        self.usage_bytes > self.limit_bytes
            || self.usage_bytes.saturating_add(additional) > self.limit_bytes
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
