//! Project allocation admin surface — the only budget scope the waterfall's
//! "project allocation" stage actually consults (`PostgresEntitlementState::
//! project_budget`, migration `0002_tenants_budgets.sql`). Plan and
//! enterprise ceilings live in the policy document instead;
//! this endpoint is for per-project headroom only.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use enforcement_core::money;
use enforcement_core::CoreError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::error::Result;
use crate::routes::gate::parse_money;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PutBudgetRequest {
    pub tenant_id: String,
    pub project_id: String,
    pub monthly_cap_usd: String,
}

#[derive(Debug, Serialize)]
pub struct BudgetView {
    pub tenant_id: String,
    pub project_id: String,
    pub monthly_cap_usd: String,
    pub used_usd: String,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PutBudgetRequest>,
) -> Result<Json<BudgetView>> {
    let cap = parse_money("monthly_cap_usd", &req.monthly_cap_usd)?;

    sqlx::query(
        r#"
        insert into project_allocations (tenant_id, project_id, monthly_cap_usd, used_usd, updated_at)
        values ($1, $2, $3, 0, now())
        on conflict (tenant_id, project_id) do update
            set monthly_cap_usd = excluded.monthly_cap_usd, updated_at = now()
        "#,
    )
    .bind(&req.tenant_id)
    .bind(&req.project_id)
    .bind(cap)
    .execute(&state.pool)
    .await
    .map_err(CoreError::from)?;

    Ok(Json(BudgetView {
        tenant_id: req.tenant_id,
        project_id: req.project_id,
        monthly_cap_usd: money::to_canonical_string(cap),
        used_usd: money::to_canonical_string(Decimal::ZERO),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListBudgetsParams {
    pub tenant_id: String,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListBudgetsParams>,
) -> Result<Json<Vec<BudgetView>>> {
    let rows = sqlx::query(
        "select tenant_id, project_id, monthly_cap_usd, used_usd from project_allocations where tenant_id = $1 order by project_id asc",
    )
    .bind(&params.tenant_id)
    .fetch_all(&state.pool)
    .await
    .map_err(CoreError::from)?;

    Ok(Json(
        rows.into_iter()
            .map(|row| BudgetView {
                tenant_id: row.get("tenant_id"),
                project_id: row.get("project_id"),
                monthly_cap_usd: money::to_canonical_string(row.get::<Decimal, _>("monthly_cap_usd")),
                used_usd: money::to_canonical_string(row.get::<Decimal, _>("used_usd")),
            })
            .collect(),
    ))
}
