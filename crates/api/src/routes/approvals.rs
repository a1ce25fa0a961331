//! The approval workflow's HTTP surface: review votes, the reviewer queue, and
//! one-time token consumption.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use enforcement_core::approval::{ApprovalStatus, ReviewVote};
use enforcement_core::approval::token::BindingContext;
use enforcement_core::decision::{Environment, Source};
use enforcement_core::ledger::reservation::ReservationLedger;
use enforcement_core::metrics::MetricsSink;
use enforcement_core::CoreError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{ApiError, Result};
use crate::routes::gate::parse_money;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub reviewer_id: String,
    pub reviewer_roles: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReviewResponse {
    pub approval_id: Uuid,
    pub status: String,
    pub quorum_count: u8,
    pub quorum_required: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
}

async fn routing_rule_for(state: &AppState, tenant_id: &str, routing_rule_id: &str) -> Result<enforcement_core::policy::RoutingRule> {
    let policy = state.policy_store.get_active(tenant_id).await?;
    policy
        .approval_routing_rules
        .into_iter()
        .find(|r| r.id == routing_rule_id)
        .ok_or_else(|| ApiError::Core(CoreError::InvariantViolation(format!(
            "approval references unknown routing rule {routing_rule_id}"
        ))))
}

async fn review(
    state: &AppState,
    approval_id: Uuid,
    req: ReviewRequest,
    vote: ReviewVote,
) -> Result<Json<ReviewResponse>> {
    let approval = state
        .approval_workflow
        .get(approval_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("approval request {approval_id} not found")))?;

    let decision = enforcement_core::decision::ledger_store::DecisionLedgerStore::get(
        &*state_ledger_store(state),
        approval.decision_id,
    )
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("decision {} not found", approval.decision_id)))?;

    let rule = routing_rule_for(state, &approval.tenant_id, &approval.routing_rule_id).await?;
    let policy = state.policy_store.get_active(&approval.tenant_id).await?;
    let separation_required = if decision.environment.is_prod() {
        policy.requester_reviewer_separation.prod
    } else {
        policy.requester_reviewer_separation.nonprod
    };

    let updated = state
        .approval_workflow
        .submit_review(approval_id, &req.reviewer_id, &req.reviewer_roles, &rule.allowed_reviewer_roles, separation_required, vote)
        .await?;

    let mut approval_token = None;
    if updated.status == ApprovalStatus::Approved {
        approval_token = Some(state.approval_workflow.issue_token(&updated, &decision, decision.project_id.as_deref())?);
    }
    if updated.status == ApprovalStatus::Denied {
        refund_and_close(&state.reservation_ledger, decision).await?;
    }

    Ok(Json(ReviewResponse {
        approval_id: updated.id,
        status: updated.status.as_str().to_string(),
        quorum_count: updated.quorum_count,
        quorum_required: updated.quorum_required,
        approval_token,
    }))
}

/// On denial the caller never executes the change; any credits reserved
/// against the REQUIRE_APPROVAL decision are released immediately rather
/// than waiting on the overdue reconciliation sweep.
async fn refund_and_close(reservation_ledger: &ReservationLedger, decision: enforcement_core::decision::Decision) -> Result<()> {
    match reservation_ledger.refund(decision.id).await {
        Ok(()) => Ok(()),
        Err(CoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Borrows the ledger store trait object out of the engine's dependency
/// graph isn't exposed on `AppState` directly; approvals fetch the decision
/// straight from Postgres instead of threading another `Arc` through.
fn state_ledger_store(state: &AppState) -> Arc<dyn enforcement_core::decision::ledger_store::DecisionLedgerStore> {
    Arc::new(enforcement_core::decision::ledger_store::PostgresDecisionLedgerStore::new(state.pool.clone()))
}

pub async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<ReviewResponse>> {
    review(&state, id, req, ReviewVote::Approve).await
}

pub async fn deny(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<ReviewResponse>> {
    review(&state, id, req, ReviewVote::Deny).await
}

#[derive(Debug, Deserialize)]
pub struct QueueParams {
    pub tenant_id: String,
}

#[derive(Debug, Serialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub requester_id: String,
    pub routing_rule_id: String,
    pub quorum_required: i16,
    pub quorum_count: i16,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub async fn queue(State(state): State<Arc<AppState>>, Query(params): Query<QueueParams>) -> Result<Json<Vec<QueueEntry>>> {
    let rows = sqlx::query(
        r#"
        select id, decision_id, requester_id, routing_rule_id, quorum_required, quorum_count, expires_at
        from approval_requests
        where tenant_id = $1 and status = 'PENDING'
        order by expires_at asc
        "#,
    )
    .bind(&params.tenant_id)
    .fetch_all(&state.pool)
    .await
    .map_err(CoreError::from)?;

    state.metrics.set_approval_queue_backlog(rows.len() as i64);

    Ok(Json(
        rows.into_iter()
            .map(|row| QueueEntry {
                id: row.get("id"),
                decision_id: row.get("decision_id"),
                requester_id: row.get("requester_id"),
                routing_rule_id: row.get("routing_rule_id"),
                quorum_required: row.get("quorum_required"),
                quorum_count: row.get("quorum_count"),
                expires_at: row.get("expires_at"),
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub token: String,
    pub tenant_id: String,
    pub project_id: Option<String>,
    pub environment: String,
    pub source: String,
    pub decision_id: Uuid,
    pub fingerprint: String,
    pub requested_monthly_delta_usd: String,
    pub requested_hourly_delta_usd: String,
}

#[derive(Debug, Serialize)]
pub struct ConsumeResponse {
    pub approval_id: Uuid,
}

pub async fn consume(State(state): State<Arc<AppState>>, Json(req): Json<ConsumeRequest>) -> Result<Json<ConsumeResponse>> {
    let environment = Environment::new(req.environment);
    let source = enforcement_core::decision::Source::parse(&req.source)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown source: {}", req.source)))?;
    let _ = source as Source;

    let requested_monthly: Decimal = parse_money("requested_monthly_delta_usd", &req.requested_monthly_delta_usd)?;
    let requested_hourly: Decimal = parse_money("requested_hourly_delta_usd", &req.requested_hourly_delta_usd)?;

    let ctx = BindingContext {
        tenant_id: &req.tenant_id,
        project_id: req.project_id.as_deref(),
        environment: &environment,
        source: req.source.as_str(),
        decision_id: req.decision_id,
        fingerprint: &req.fingerprint,
        requested_monthly_delta_usd: requested_monthly,
        requested_hourly_delta_usd: requested_hourly,
    };

    let claims = state.approval_workflow.verify_and_bind(&req.token, &ctx)?;
    state.approval_workflow.consume(claims.approval_id).await?;

    Ok(Json(ConsumeResponse { approval_id: claims.approval_id }))
}
