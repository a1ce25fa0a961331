//! The deterministic parity export bundle.

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::csv::render_table;
use crate::manifest::{canonical_json_bytes, computed_context_lineage, hmac_sign, policy_lineage, sha256_hex, ManifestMetadata};
use crate::source::{ExportDataSource, Window};
use crate::Result;

pub struct ExportBundle {
    pub decisions_csv: String,
    pub approvals_csv: String,
    pub reservations_csv: String,
    pub ledger_csv: String,
    pub manifest_canonical_json: Vec<u8>,
    pub manifest_sha256: String,
    pub manifest_sig: String,
}

pub struct ExportSigner {
    pub secret: String,
    pub kid: String,
}

/// Builds the four CSVs plus the signed manifest for `tenant_id` over
/// `window`. Byte-identical across repeated invocations over the same
/// underlying data: row order is the source's own deterministic order
/// (callers sort by primary key), and the manifest is built from sorted
/// lineage buckets rather than insertion order.
pub async fn build_export_bundle(
    tenant_id: &str,
    window: Window,
    source: Arc<dyn ExportDataSource>,
    signer: &ExportSigner,
) -> Result<ExportBundle> {
    let decisions = source.decisions(tenant_id, &window).await?;
    let approvals = source.approvals(tenant_id, &window).await?;
    let reservations = source.reservations(tenant_id, &window).await?;
    let ledger = source.ledger(tenant_id, &window).await?;

    let decisions_csv = render_table(
        &[
            "decision_id", "tenant_id", "source", "action", "environment", "status", "reason_code",
            "policy_version", "policy_document_sha256", "computed_context_version",
            "computed_context_generated_at", "month_start", "month_end", "data_source_mode",
        ],
        &decisions
            .iter()
            .map(|d| {
                vec![
                    d.decision_id.to_string(),
                    d.tenant_id.clone(),
                    d.source.clone(),
                    d.action.clone(),
                    d.environment.clone(),
                    d.status.clone(),
                    d.reason_code.clone(),
                    d.policy_version.to_string(),
                    d.policy_document_sha256.clone(),
                    d.computed_context_version.to_string(),
                    d.computed_context_generated_at.to_rfc3339(),
                    d.month_start.to_string(),
                    d.month_end.to_string(),
                    d.data_source_mode.clone(),
                ]
            })
            .collect::<Vec<_>>(),
    );

    let approvals_csv = render_table(
        &[
            "approval_id", "decision_id", "tenant_id", "status", "routing_rule_id",
            "quorum_required", "quorum_count", "reviewer_id", "reviewed_at", "expires_at",
        ],
        &approvals
            .iter()
            .map(|a| {
                vec![
                    a.approval_id.to_string(),
                    a.decision_id.to_string(),
                    a.tenant_id.clone(),
                    a.status.clone(),
                    a.routing_rule_id.clone(),
                    a.quorum_required.to_string(),
                    a.quorum_count.to_string(),
                    a.reviewer_id.clone().unwrap_or_default(),
                    a.reviewed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    a.expires_at.to_rfc3339(),
                ]
            })
            .collect::<Vec<_>>(),
    );

    let reservations_csv = render_table(
        &["decision_id", "grant_id", "pool_type", "amount_usd", "state"],
        &reservations
            .iter()
            .map(|r| {
                vec![
                    r.decision_id.to_string(),
                    r.grant_id.to_string(),
                    r.pool_type.clone(),
                    decimal_string(r.amount_usd),
                    r.state.clone(),
                ]
            })
            .collect::<Vec<_>>(),
    );

    let ledger_csv = render_table(
        &["sequence", "decision_id", "status", "recorded_at"],
        &ledger
            .iter()
            .map(|l| vec![l.sequence.to_string(), l.decision_id.to_string(), l.status.clone(), l.recorded_at.to_rfc3339()])
            .collect::<Vec<_>>(),
    );

    let policy_lineage = policy_lineage(&decisions);
    let context_lineage = computed_context_lineage(&decisions);

    let metadata = ManifestMetadata {
        tenant_id: tenant_id.to_string(),
        window_start: window.start,
        window_end: window.end,
        decision_count: decisions.len(),
        approval_count: approvals.len(),
        reservation_count: reservations.len(),
        ledger_count: ledger.len(),
        decisions_sha256: sha256_hex(decisions_csv.as_bytes()),
        approvals_sha256: sha256_hex(approvals_csv.as_bytes()),
        reservations_sha256: sha256_hex(reservations_csv.as_bytes()),
        ledger_sha256: sha256_hex(ledger_csv.as_bytes()),
        policy_lineage_sha256: policy_lineage.sha256,
        policy_lineage_entries: policy_lineage.entries,
        computed_context_lineage_sha256: context_lineage.sha256,
        computed_context_lineage_entries: context_lineage.entries,
        kid: signer.kid.clone(),
    };

    let manifest_canonical_json = canonical_json_bytes(&metadata);
    let manifest_sha256 = sha256_hex(&manifest_canonical_json);
    let manifest_sig = hmac_sign(&manifest_canonical_json, &signer.secret);

    Ok(ExportBundle {
        decisions_csv,
        approvals_csv,
        reservations_csv,
        ledger_csv,
        manifest_canonical_json,
        manifest_sha256,
        manifest_sig,
    })
}

fn decimal_string(value: Decimal) -> String {
    enforcement_core::money::to_canonical_string(value)
}
