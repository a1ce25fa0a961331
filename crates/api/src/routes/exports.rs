//! The export bundle HTTP surface. `archive` returns the full CSV+manifest
//! bundle; `parity` returns just the manifest digests (including the
//! policy/computed-context lineage hashes) for a cheap anti-tamper check
//! without shipping the underlying rows.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use enforcement_export::{build_export_bundle, ExportDataSource, Window};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub tenant_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ParityResponse {
    pub tenant_id: String,
    pub manifest_sha256: String,
    pub manifest_sig: String,
    pub decision_count: usize,
    pub approval_count: usize,
    pub reservation_count: usize,
    pub ledger_count: usize,
    pub policy_lineage_sha256: String,
    pub policy_lineage_entries: usize,
    pub computed_context_lineage_sha256: String,
    pub computed_context_lineage_entries: usize,
}

#[derive(Debug, Serialize)]
pub struct ArchiveResponse {
    pub tenant_id: String,
    pub decisions_csv: String,
    pub approvals_csv: String,
    pub reservations_csv: String,
    pub ledger_csv: String,
    pub manifest_canonical_json: String,
    pub manifest_sha256: String,
    pub manifest_sig: String,
}

pub async fn parity(State(state): State<Arc<AppState>>, Query(params): Query<ExportParams>) -> Result<Json<ParityResponse>> {
    let window = Window { start: params.window_start, end: params.window_end };
    let source = state.export_source.clone() as Arc<dyn ExportDataSource>;
    let bundle = build_export_bundle(&params.tenant_id, window, source, &state.export_signer).await?;

    #[derive(Deserialize)]
    struct Counts {
        decision_count: usize,
        approval_count: usize,
        reservation_count: usize,
        ledger_count: usize,
        policy_lineage_sha256: String,
        policy_lineage_entries: usize,
        computed_context_lineage_sha256: String,
        computed_context_lineage_entries: usize,
    }
    let counts: Counts = serde_json::from_slice(&bundle.manifest_canonical_json)
        .map_err(|e| crate::error::ApiError::Internal(anyhow::anyhow!("malformed manifest: {e}")))?;

    Ok(Json(ParityResponse {
        tenant_id: params.tenant_id,
        manifest_sha256: bundle.manifest_sha256,
        manifest_sig: bundle.manifest_sig,
        decision_count: counts.decision_count,
        approval_count: counts.approval_count,
        reservation_count: counts.reservation_count,
        ledger_count: counts.ledger_count,
        policy_lineage_sha256: counts.policy_lineage_sha256,
        policy_lineage_entries: counts.policy_lineage_entries,
        computed_context_lineage_sha256: counts.computed_context_lineage_sha256,
        computed_context_lineage_entries: counts.computed_context_lineage_entries,
    }))
}

pub async fn archive(State(state): State<Arc<AppState>>, Query(params): Query<ExportParams>) -> Result<Json<ArchiveResponse>> {
    let window = Window { start: params.window_start, end: params.window_end };
    let source = state.export_source.clone() as Arc<dyn ExportDataSource>;
    let bundle = build_export_bundle(&params.tenant_id, window, source, &state.export_signer).await?;

    Ok(Json(ArchiveResponse {
        tenant_id: params.tenant_id,
        decisions_csv: bundle.decisions_csv,
        approvals_csv: bundle.approvals_csv,
        reservations_csv: bundle.reservations_csv,
        ledger_csv: bundle.ledger_csv,
        manifest_canonical_json: String::from_utf8_lossy(&bundle.manifest_canonical_json).to_string(),
        manifest_sha256: bundle.manifest_sha256,
        manifest_sig: bundle.manifest_sig,
    }))
}
