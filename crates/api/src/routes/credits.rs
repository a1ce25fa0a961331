//! The credit ledger's admin surface: issue a new credit grant (reserved or
//! emergency pool), list a tenant's grants.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use enforcement_core::ledger::grants::CreditPoolType;
use enforcement_core::money;
use enforcement_core::CoreError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{ApiError, Result};
use crate::routes::gate::parse_money;
use crate::state::AppState;

fn parse_pool_type(raw: &str) -> Result<CreditPoolType> {
    match raw {
        "reserved" => Ok(CreditPoolType::Reserved),
        "emergency" => Ok(CreditPoolType::Emergency),
        other => Err(ApiError::BadRequest(format!("unknown pool_type: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCreditGrantRequest {
    pub tenant_id: String,
    pub pool_type: String,
    pub initial_amount_usd: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CreditGrantView {
    pub id: Uuid,
    pub tenant_id: String,
    pub pool_type: String,
    pub initial_amount_usd: String,
    pub remaining_amount_usd: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCreditGrantRequest>,
) -> Result<Json<CreditGrantView>> {
    let pool_type = parse_pool_type(&req.pool_type)?;
    let amount = parse_money("initial_amount_usd", &req.initial_amount_usd)?;
    if amount <= Decimal::ZERO {
        return Err(ApiError::BadRequest("initial_amount_usd must be positive".into()));
    }
    let id = Uuid::new_v4();

    sqlx::query(
        r#"
        insert into credit_grants (id, tenant_id, pool_type, initial_amount_usd, remaining_amount_usd, expires_at)
        values ($1, $2, $3, $4, $4, $5)
        "#,
    )
    .bind(id)
    .bind(&req.tenant_id)
    .bind(pool_type.as_str())
    .bind(amount)
    .bind(req.expires_at)
    .execute(&state.pool)
    .await
    .map_err(CoreError::from)?;

    Ok(Json(CreditGrantView {
        id,
        tenant_id: req.tenant_id,
        pool_type: pool_type.as_str().to_string(),
        initial_amount_usd: money::to_canonical_string(amount),
        remaining_amount_usd: money::to_canonical_string(amount),
        expires_at: req.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListCreditGrantsParams {
    pub tenant_id: String,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListCreditGrantsParams>,
) -> Result<Json<Vec<CreditGrantView>>> {
    let rows = sqlx::query(
        r#"
        select id, tenant_id, pool_type, initial_amount_usd, remaining_amount_usd, expires_at
        from credit_grants
        where tenant_id = $1
        order by expires_at asc, created_at asc, id asc
        "#,
    )
    .bind(&params.tenant_id)
    .fetch_all(&state.pool)
    .await
    .map_err(CoreError::from)?;

    Ok(Json(
        rows.into_iter()
            .map(|row| CreditGrantView {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                pool_type: row.get("pool_type"),
                initial_amount_usd: money::to_canonical_string(row.get::<Decimal, _>("initial_amount_usd")),
                remaining_amount_usd: money::to_canonical_string(row.get::<Decimal, _>("remaining_amount_usd")),
                expires_at: row.get("expires_at"),
            })
            .collect(),
    ))
}
