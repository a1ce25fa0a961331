//! Postgres-backed [`ExportDataSource`] for the export bundle builder, reading
//! the same tables the credit ledger, decision engine, decision ledger, and
//! approval workflow own. Kept in `enforcement-api` rather than
//! `enforcement-export` so the export crate never links `sqlx` directly,
//! mirroring how `enforcement-core` keeps `TenantDirectory`/`CostHistoryReader`
//! collaborator traits storage-agnostic.

use async_trait::async_trait;
use enforcement_core::error::CoreError;
use enforcement_export::{ApprovalRow, DecisionRow, ExportDataSource, LedgerRow, ReservationRow, Window};
use sqlx::{PgPool, Row};

pub struct PostgresExportDataSource {
    pool: PgPool,
}

impl PostgresExportDataSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx_err(e: sqlx::Error) -> enforcement_export::ExportError {
    CoreError::from(e).into()
}

#[async_trait]
impl ExportDataSource for PostgresExportDataSource {
    async fn decisions(&self, tenant_id: &str, window: &Window) -> enforcement_export::Result<Vec<DecisionRow>> {
        let rows = sqlx::query(
            r#"
            select id, tenant_id, source, action, environment, status, reason_code,
                   policy_version, policy_document_sha256, computed_context
            from decisions
            where tenant_id = $1 and created_at >= $2 and created_at <= $3
            order by id asc
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter()
            .map(|row| {
                let raw_context: serde_json::Value = row.get("computed_context");
                let context: enforcement_core::context::ComputedContext = serde_json::from_value(raw_context)
                    .map_err(|e| {
                        enforcement_export::ExportError::from(CoreError::InvariantViolation(format!(
                            "malformed computed_context jsonb: {e}"
                        )))
                    })?;
                Ok(DecisionRow {
                    decision_id: row.get("id"),
                    tenant_id: row.get("tenant_id"),
                    source: row.get("source"),
                    action: row.get("action"),
                    environment: row.get("environment"),
                    status: row.get("status"),
                    reason_code: row.get("reason_code"),
                    policy_version: row.get("policy_version"),
                    policy_document_sha256: row.get("policy_document_sha256"),
                    computed_context_version: context.context_version,
                    computed_context_generated_at: context.generated_at,
                    month_start: context.month_start,
                    month_end: context.month_end,
                    data_source_mode: format!("{:?}", context.data_source_mode).to_lowercase(),
                })
            })
            .collect()
    }

    async fn approvals(&self, tenant_id: &str, window: &Window) -> enforcement_export::Result<Vec<ApprovalRow>> {
        let rows = sqlx::query(
            r#"
            select a.id, a.decision_id, a.tenant_id, a.status, a.routing_rule_id,
                   a.quorum_required, a.quorum_count, a.reviewer_id, a.reviewed_at, a.expires_at
            from approval_requests a
            join decisions d on d.id = a.decision_id
            where a.tenant_id = $1 and d.created_at >= $2 and d.created_at <= $3
            order by a.id asc
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|row| ApprovalRow {
                approval_id: row.get("id"),
                decision_id: row.get("decision_id"),
                tenant_id: row.get("tenant_id"),
                status: row.get("status"),
                routing_rule_id: row.get("routing_rule_id"),
                quorum_required: row.get::<i16, _>("quorum_required") as u8,
                quorum_count: row.get::<i16, _>("quorum_count") as u8,
                reviewer_id: row.get("reviewer_id"),
                reviewed_at: row.get("reviewed_at"),
                expires_at: row.get("expires_at"),
            })
            .collect())
    }

    async fn reservations(&self, tenant_id: &str, window: &Window) -> enforcement_export::Result<Vec<ReservationRow>> {
        let rows = sqlx::query(
            r#"
            select r.decision_id, r.grant_id, r.pool_type, r.amount_usd, r.state
            from reservation_allocations r
            join decisions d on d.id = r.decision_id
            where d.tenant_id = $1 and d.created_at >= $2 and d.created_at <= $3
            order by r.decision_id asc, r.grant_id asc
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|row| ReservationRow {
                decision_id: row.get("decision_id"),
                grant_id: row.get("grant_id"),
                pool_type: row.get("pool_type"),
                amount_usd: row.get("amount_usd"),
                state: row.get("state"),
            })
            .collect())
    }

    async fn ledger(&self, tenant_id: &str, window: &Window) -> enforcement_export::Result<Vec<LedgerRow>> {
        let rows = sqlx::query(
            r#"
            select l.sequence, l.decision_id, d.status, l.recorded_at
            from decision_ledger l
            join decisions d on d.id = l.decision_id
            where d.tenant_id = $1 and l.recorded_at >= $2 and l.recorded_at <= $3
            order by l.sequence asc
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|row| LedgerRow {
                sequence: row.get("sequence"),
                decision_id: row.get("decision_id"),
                status: row.get("status"),
                recorded_at: row.get("recorded_at"),
            })
            .collect())
    }
}
