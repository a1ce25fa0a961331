//! Wire DTOs for the gate HTTP API, mirrored from `enforcement-api`'s
//! `models`/`routes` module. The SDK intentionally does not depend on
//! `enforcement-core`, so `computed_context` and `entitlement_waterfall` stay
//! opaque [`serde_json::Value`] trees rather than typed structs — callers
//! that need to inspect them deserialize the shape they care about.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Request body for `POST /api/v1/enforcement/gate`.
#[derive(Debug, Clone, Serialize)]
pub struct GateRequest {
    pub tenant_id: String,
    pub idempotency_key: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub environment: String,
    pub resource_ref: String,
    pub estimated_monthly_delta_usd: String,
    pub estimated_hourly_delta_usd: String,
    pub requester_id: String,
}

/// The envelope every `gate/*` route returns.
#[derive(Debug, Clone, Deserialize)]
pub struct GateDecisionResponse {
    pub decision_id: Uuid,
    pub status: String,
    pub reason_code: String,
    pub computed_context: Value,
    pub entitlement_waterfall: Value,
    pub approval_request_id: Option<Uuid>,
    pub approval_token_contract: String,
    pub policy_version: i64,
    pub policy_document_sha256: String,
    pub mode_scope: Value,
}

impl GateDecisionResponse {
    /// True for `ALLOW`, `ALLOW_WITH_CREDITS`, and `FAIL_SAFE_ALLOW` — the
    /// same terminal-allow set `Decision::is_allow` recognizes server-side.
    pub fn is_allow(&self) -> bool {
        matches!(self.status.as_str(), "ALLOW" | "ALLOW_WITH_CREDITS" | "FAIL_SAFE_ALLOW")
    }

    pub fn requires_approval(&self) -> bool {
        matches!(self.status.as_str(), "REQUIRE_APPROVAL" | "FAIL_SAFE_REQUIRE_APPROVAL")
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerraformStage {
    Plan,
    Apply,
}

impl TerraformStage {
    pub fn as_str(self) -> &'static str {
        match self {
            TerraformStage::Plan => "plan",
            TerraformStage::Apply => "apply",
        }
    }
}

/// Request body for `POST /api/v1/enforcement/gate/terraform/preflight`.
#[derive(Debug, Clone, Serialize)]
pub struct TerraformPreflightRequest {
    pub tenant_id: String,
    pub run_id: String,
    pub stage: TerraformStage,
    pub resource_addr: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub environment: String,
    pub estimated_cost_delta_usd_monthly: String,
    pub estimated_cost_delta_usd_hourly: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_request_fingerprint: Option<String>,
    pub requester_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerraformPreflightResponse {
    #[serde(flatten)]
    pub decision: GateDecisionResponse,
    pub poll_url: String,
    pub approval_request_id: Option<Uuid>,
}

/// Request body for `POST /api/v1/enforcement/gate/cloud-event`, matching
/// the CloudEvents v1.0 envelope the adapter consumes.
#[derive(Debug, Clone, Serialize)]
pub struct CloudEventRequest {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// Request body for `POST /api/v1/enforcement/approvals/consume`. The
/// Actions Orchestrator calls this immediately before executing an approved
/// change, binding the token to the exact cost/fingerprint it is about to
/// apply.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeTokenRequest {
    pub token: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub environment: String,
    pub source: String,
    pub decision_id: Uuid,
    pub fingerprint: String,
    pub requested_monthly_delta_usd: String,
    pub requested_hourly_delta_usd: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumeTokenResponse {
    pub approval_id: Uuid,
}

/// `GET /api/v1/enforcement/ledger?decision_id=...` response shape when a
/// single decision is requested — what a preflight response's `poll_url`
/// resolves to.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionView {
    pub id: Uuid,
    pub status: String,
    pub reason_code: String,
    pub approval_request_id: Option<Uuid>,
}

/// The `{error, reason_code}` body every non-2xx enforcement response
/// returns, per `enforcement-api`'s `ApiError` mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub reason_code: String,
}
