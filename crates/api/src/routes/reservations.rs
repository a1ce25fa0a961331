//! The manual reservation reconcile endpoint. Honors the `Idempotency-Key`
//! header per the external interface contract: header takes precedence over
//! a body-supplied key when both are present, and the two must agree.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::Result;
use crate::routes::gate::parse_money;
use crate::state::AppState;
use serde::{Deserialize, Serialize};

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub decision_id: Uuid,
    pub actual_usd: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub decision_id: Uuid,
    pub outcome: String,
}

pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<ReconcileResponse>> {
    let actual_usd: Decimal = parse_money("actual_usd", &req.actual_usd)?;
    let header_key = headers.get(IDEMPOTENCY_KEY_HEADER).and_then(|v| v.to_str().ok());

    let outcome = state
        .reconciliation_worker
        .reconcile_manual(req.decision_id, actual_usd, header_key, req.idempotency_key.as_deref())
        .await?;

    let outcome_str = match outcome {
        enforcement_core::reconcile::ManualReconcileOutcome::Settled => "SETTLED",
        enforcement_core::reconcile::ManualReconcileOutcome::Refunded => "REFUNDED",
    };

    Ok(Json(ReconcileResponse { decision_id: req.decision_id, outcome: outcome_str.to_string() }))
}
