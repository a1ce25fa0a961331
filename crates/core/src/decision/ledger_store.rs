//! The append-only decision ledger.
//!
//! Ledger rows are never updated or deleted; the invariant is enforced in
//! the database by a trigger that rejects `UPDATE`/`DELETE` on the
//! `decision_ledger` table (see `crates/core/migrations`). This module only
//! ever calls `append`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::context::ComputedContext;
use crate::decision::model::{Decision, DecisionStatus, Environment, Source};
use crate::error::{CoreError, Result};
use crate::failsafe::{Mode, ModeScope};
use crate::ledger::grants::CreditAllocation;
use crate::waterfall::WaterfallOutcome;

/// One immutable row. `sequence` is assigned by the database
/// (`generated always as identity`) so two concurrent appends can never
/// collide.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub sequence: i64,
    pub decision: Decision,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait DecisionLedgerStore: Send + Sync {
    async fn append(&self, decision: &Decision) -> Result<LedgerEntry>;

    /// Idempotency replay lookup keyed by the decision's unique
    /// `(tenant_id, source, idempotency_key)`.
    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<Decision>>;

    async fn get(&self, decision_id: Uuid) -> Result<Option<Decision>>;

    /// Ledger rows in append order, for the export bundle builder.
    async fn list_since(&self, sequence_after: i64, limit: i64) -> Result<Vec<LedgerEntry>>;
}

fn scope_static(scope: &str) -> &'static str {
    match scope {
        "terraform_mode_prod" => "terraform_mode_prod",
        "terraform_mode_nonprod" => "terraform_mode_nonprod",
        "k8s_admission_mode_prod" => "k8s_admission_mode_prod",
        "k8s_admission_mode_nonprod" => "k8s_admission_mode_nonprod",
        "cloud_event_mode" => "cloud_event_mode",
        _ => "generic_mode",
    }
}

fn encode_mode_scope(mode_scope: ModeScope) -> String {
    format!("{}:{}", mode_scope.mode.as_str(), mode_scope.scope)
}

fn decode_mode_scope(raw: &str) -> Result<ModeScope> {
    let (mode_str, scope) = raw
        .split_once(':')
        .ok_or_else(|| CoreError::InvariantViolation(format!("malformed mode_scope: {raw}")))?;
    let mode = Mode::parse(mode_str)
        .ok_or_else(|| CoreError::InvariantViolation(format!("unknown mode in mode_scope: {raw}")))?;
    Ok(ModeScope { mode, scope: scope_static(scope) })
}

/// Postgres-backed append-only ledger. `append` upserts the mutable scalar
/// projection in `decisions` (the columns an approval callback or
/// reconciliation later revises: status, reason_code, approval_request_id,
/// the nested jsonb snapshots) and always inserts a fresh row into
/// `decision_ledger`, whose own update/delete triggers reject any mutation.
pub struct PostgresDecisionLedgerStore {
    pool: PgPool,
}

impl PostgresDecisionLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_decision(row: &sqlx::postgres::PgRow) -> Result<Decision> {
    let source: String = row.get("source");
    let environment: String = row.get("environment");
    let status: String = row.get("status");
    let mode_scope: String = row.get("mode_scope");
    let computed_context: serde_json::Value = row.get("computed_context");
    let entitlement_waterfall: serde_json::Value = row.get("entitlement_waterfall");
    let credit_allocations: serde_json::Value = row.get("credit_allocations");

    Ok(Decision {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        source: Source::parse(&source)
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown source: {source}")))?,
        action: row.get("action"),
        project_id: row.get("project_id"),
        environment: Environment::new(environment),
        resource_ref: row.get("resource_ref"),
        idempotency_key: row.get("idempotency_key"),
        request_fingerprint: row.get("request_fingerprint"),
        status: DecisionStatus::parse(&status)
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown status: {status}")))?,
        reason_code: row.get("reason_code"),
        estimated_monthly_delta_usd: row.get("estimated_monthly_delta_usd"),
        estimated_hourly_delta_usd: row.get("estimated_hourly_delta_usd"),
        computed_context: serde_json::from_value::<ComputedContext>(computed_context)
            .map_err(|e| CoreError::InvariantViolation(format!("corrupt computed_context: {e}")))?,
        entitlement_waterfall: serde_json::from_value::<WaterfallOutcome>(entitlement_waterfall)
            .map_err(|e| CoreError::InvariantViolation(format!("corrupt entitlement_waterfall: {e}")))?,
        credit_allocations: serde_json::from_value::<Vec<CreditAllocation>>(credit_allocations)
            .map_err(|e| CoreError::InvariantViolation(format!("corrupt credit_allocations: {e}")))?,
        policy_version: row.get("policy_version"),
        policy_document_sha256: row.get("policy_document_sha256"),
        policy_document_schema_version: row.get::<i32, _>("policy_document_schema_version") as u32,
        mode_scope: decode_mode_scope(&mode_scope)?,
        approval_request_id: row.get("approval_request_id"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl DecisionLedgerStore for PostgresDecisionLedgerStore {
    async fn append(&self, decision: &Decision) -> Result<LedgerEntry> {
        let computed_context = serde_json::to_value(&decision.computed_context)
            .map_err(|e| CoreError::InvariantViolation(format!("failed to serialize computed_context: {e}")))?;
        let entitlement_waterfall = serde_json::to_value(&decision.entitlement_waterfall)
            .map_err(|e| CoreError::InvariantViolation(format!("failed to serialize entitlement_waterfall: {e}")))?;
        let credit_allocations = serde_json::to_value(&decision.credit_allocations)
            .map_err(|e| CoreError::InvariantViolation(format!("failed to serialize credit_allocations: {e}")))?;
        let mode_scope = encode_mode_scope(decision.mode_scope);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            insert into decisions (
                id, tenant_id, source, idempotency_key, request_fingerprint, action, project_id,
                environment, resource_ref, status, reason_code, estimated_monthly_delta_usd,
                estimated_hourly_delta_usd, policy_version, policy_document_sha256,
                policy_document_schema_version, mode_scope, approval_request_id, created_at,
                computed_context, entitlement_waterfall, credit_allocations
            ) values (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
            )
            on conflict (id) do update set
                status = excluded.status,
                reason_code = excluded.reason_code,
                approval_request_id = excluded.approval_request_id,
                computed_context = excluded.computed_context,
                entitlement_waterfall = excluded.entitlement_waterfall,
                credit_allocations = excluded.credit_allocations
            "#,
        )
        .bind(decision.id)
        .bind(&decision.tenant_id)
        .bind(decision.source.as_str())
        .bind(&decision.idempotency_key)
        .bind(&decision.request_fingerprint)
        .bind(&decision.action)
        .bind(&decision.project_id)
        .bind(decision.environment.as_str())
        .bind(&decision.resource_ref)
        .bind(decision.status.as_str())
        .bind(&decision.reason_code)
        .bind(decision.estimated_monthly_delta_usd)
        .bind(decision.estimated_hourly_delta_usd)
        .bind(decision.policy_version)
        .bind(&decision.policy_document_sha256)
        .bind(decision.policy_document_schema_version as i32)
        .bind(&mode_scope)
        .bind(decision.approval_request_id)
        .bind(decision.created_at)
        .bind(&computed_context)
        .bind(&entitlement_waterfall)
        .bind(&credit_allocations)
        .execute(&mut *tx)
        .await?;

        let snapshot = serde_json::to_value(decision)
            .map_err(|e| CoreError::InvariantViolation(format!("failed to snapshot decision: {e}")))?;
        let row = sqlx::query(
            r#"
            insert into decision_ledger (decision_id, snapshot)
            values ($1, $2)
            returning sequence, recorded_at
            "#,
        )
        .bind(decision.id)
        .bind(&snapshot)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(LedgerEntry {
            sequence: row.get("sequence"),
            decision: decision.clone(),
            recorded_at: row.get("recorded_at"),
        })
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<Decision>> {
        let row = sqlx::query(
            r#"
            select * from decisions
            where tenant_id = $1 and source = $2 and idempotency_key = $3
            "#,
        )
        .bind(tenant_id)
        .bind(source)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_decision).transpose()
    }

    async fn get(&self, decision_id: Uuid) -> Result<Option<Decision>> {
        let row = sqlx::query("select * from decisions where id = $1")
            .bind(decision_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_decision).transpose()
    }

    async fn list_since(&self, sequence_after: i64, limit: i64) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            select l.sequence, l.recorded_at, d.*
            from decision_ledger l
            join decisions d on d.id = l.decision_id
            where l.sequence > $1
            order by l.sequence asc
            limit $2
            "#,
        )
        .bind(sequence_after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(LedgerEntry {
                    sequence: row.get("sequence"),
                    decision: row_to_decision(row)?,
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect()
    }
}
