//! External collaborator: daily cost totals, upstream of context computation.
//!
//! Mirrors `daily_costs` (migration 0008). The core never derives these
//! figures from raw telemetry; it only consumes whatever an upstream cloud
//! cost adapter has already aggregated per tenant per day.

use async_trait::async_trait;
use chrono::NaiveDate;
use enforcement_core::context::CostHistoryReader;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};

pub struct PostgresCostHistoryReader {
    pool: PgPool,
}

impl PostgresCostHistoryReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CostHistoryReader for PostgresCostHistoryReader {
    async fn daily_costs(
        &self,
        tenant_id: &str,
        month_start: NaiveDate,
        through: NaiveDate,
    ) -> anyhow::Result<Vec<(NaiveDate, Decimal)>> {
        let rows = sqlx::query(
            r#"
            select cost_date, amount_usd
            from daily_costs
            where tenant_id = $1 and cost_date >= $2 and cost_date <= $3
            order by cost_date asc
            "#,
        )
        .bind(tenant_id)
        .bind(month_start)
        .bind(through)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("cost_date"), row.get("amount_usd")))
            .collect())
    }
}
