//! Terraform preflight adapters: the legacy `POST /gate/terraform` shape and
//! the run/stage-aware `POST /gate/terraform/preflight` v2.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use enforcement_core::decision::{DecisionInput, Environment, Source};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;
use crate::models::GateDecisionResponse;
use crate::routes::gate::{self, parse_money};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Apply,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Apply => "apply",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TerraformPreflightRequest {
    pub tenant_id: String,
    pub run_id: String,
    pub stage: Stage,
    pub resource_addr: String,
    pub action: String,
    pub project_id: Option<String>,
    pub environment: String,
    pub estimated_cost_delta_usd_monthly: String,
    pub estimated_cost_delta_usd_hourly: String,
    pub expected_request_fingerprint: Option<String>,
    pub requester_id: String,
}

#[derive(Debug, Serialize)]
pub struct TerraformPreflightResponse {
    #[serde(flatten)]
    pub decision: GateDecisionResponse,
    pub poll_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<Uuid>,
}

fn terraform_fingerprint(resource_addr: &str, action: &str, monthly: &str, hourly: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource_addr.as_bytes());
    hasher.update(b"|");
    hasher.update(action.as_bytes());
    hasher.update(b"|");
    hasher.update(monthly.as_bytes());
    hasher.update(b"|");
    hasher.update(hourly.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[allow(clippy::too_many_arguments)]
async fn run_preflight(
    state: Arc<AppState>,
    tenant_id: String,
    run_id: String,
    stage: Stage,
    resource_addr: String,
    action: String,
    project_id: Option<String>,
    environment: String,
    monthly_raw: String,
    hourly_raw: String,
    expected_request_fingerprint: Option<String>,
    requester_id: String,
) -> Result<Json<TerraformPreflightResponse>> {
    let monthly = parse_money("estimated_cost_delta_usd_monthly", &monthly_raw)?;
    let hourly = parse_money("estimated_cost_delta_usd_hourly", &hourly_raw)?;

    let computed_fingerprint = terraform_fingerprint(&resource_addr, &action, &monthly_raw, &hourly_raw);
    if let Some(expected) = &expected_request_fingerprint {
        if expected != &computed_fingerprint {
            return Err(crate::error::ApiError::BadRequest(
                "expected_request_fingerprint does not match computed fingerprint".to_string(),
            ));
        }
    }

    let idempotency_key = format!("terraform:{run_id}:{}", stage.as_str());

    let input = DecisionInput {
        tenant_id,
        source: Source::Terraform,
        idempotency_key,
        request_fingerprint: computed_fingerprint,
        action,
        project_id,
        environment: Environment::new(environment),
        resource_ref: resource_addr,
        estimated_monthly_delta_usd: monthly,
        estimated_hourly_delta_usd: hourly,
        requester_id,
    };

    let Json(decision) = gate::evaluate(&state, Source::Terraform, "gate.terraform", input).await?;
    let approval_request_id = decision.approval_request_id;
    Ok(Json(TerraformPreflightResponse {
        poll_url: format!("/api/v1/enforcement/ledger?decision_id={}", decision.decision_id),
        approval_request_id,
        decision,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TerraformV1Request {
    pub tenant_id: String,
    pub run_id: String,
    pub resource_addr: String,
    pub action: String,
    pub project_id: Option<String>,
    pub environment: String,
    pub estimated_cost_delta_usd_monthly: String,
    pub estimated_cost_delta_usd_hourly: String,
    pub requester_id: String,
}

pub async fn handle_v1(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TerraformV1Request>,
) -> Result<Json<TerraformPreflightResponse>> {
    run_preflight(
        state,
        req.tenant_id,
        req.run_id,
        Stage::Plan,
        req.resource_addr,
        req.action,
        req.project_id,
        req.environment,
        req.estimated_cost_delta_usd_monthly,
        req.estimated_cost_delta_usd_hourly,
        None,
        req.requester_id,
    )
    .await
}

/// Terraform run/stage-aware preflight gate check.
#[utoipa::path(
    post,
    path = "/api/v1/enforcement/gate/terraform/preflight",
    tag = "gate",
    responses(
        (status = 200, description = "Gate decision plus poll_url and approval_request_id"),
        (status = 422, description = "Invalid request payload, or expected_request_fingerprint mismatch"),
    )
)]
pub async fn handle_preflight(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TerraformPreflightRequest>,
) -> Result<Json<TerraformPreflightResponse>> {
    run_preflight(
        state,
        req.tenant_id,
        req.run_id,
        req.stage,
        req.resource_addr,
        req.action,
        req.project_id,
        req.environment,
        req.estimated_cost_delta_usd_monthly,
        req.estimated_cost_delta_usd_hourly,
        req.expected_request_fingerprint,
        req.requester_id,
    )
    .await
}
