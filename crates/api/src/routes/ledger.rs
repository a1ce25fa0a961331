//! The decision ledger's read surface. `GET /ledger?decision_id=...` backs the
//! `poll_url` every preflight response returns; `GET /ledger?since=...`
//! lists raw append-order ledger rows for the export bundle's consumers to
//! cross-check against.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use enforcement_core::decision::ledger_store::DecisionLedgerStore;
use enforcement_core::decision::Decision;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LedgerParams {
    pub decision_id: Option<Uuid>,
    pub since: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LedgerEntryView {
    pub sequence: i64,
    pub decision_id: Uuid,
    pub status: String,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LedgerResponse {
    Decision(Box<Decision>),
    Entries(Vec<LedgerEntryView>),
}

const DEFAULT_LIST_LIMIT: i64 = 100;

pub async fn list(State(state): State<Arc<AppState>>, Query(params): Query<LedgerParams>) -> Result<Json<LedgerResponse>> {
    if let Some(decision_id) = params.decision_id {
        let decision = state
            .ledger_store
            .get(decision_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;
        return Ok(Json(LedgerResponse::Decision(Box::new(decision))));
    }

    let since = params.since.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1000);
    let entries = state.ledger_store.list_since(since, limit).await?;
    Ok(Json(LedgerResponse::Entries(
        entries
            .into_iter()
            .map(|e| LedgerEntryView {
                sequence: e.sequence,
                decision_id: e.decision.id,
                status: e.decision.status.as_str().to_string(),
                recorded_at: e.recorded_at,
            })
            .collect(),
    )))
}
