//! Shared request/response DTOs for the gate protocol adapters. Each
//! adapter (`routes::gate`, `routes::terraform`, `routes::k8s`,
//! `routes::cloud_event`) builds a [`GateDecisionResponse`] from the
//! [`enforcement_core::decision::Decision`] the engine returns — the common
//! envelope every `gate/*` route promises per the external interface
//! contract.

use enforcement_core::context::ComputedContext;
use enforcement_core::decision::Decision;
use enforcement_core::failsafe::ModeScope;
use enforcement_core::waterfall::WaterfallOutcome;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generic gate input accepted by `POST /api/v1/enforcement/gate` and reused
/// by the other adapters after they normalize their source-specific payload
/// into this shape.
#[derive(Debug, Clone, Deserialize)]
pub struct GateRequest {
    pub tenant_id: String,
    pub idempotency_key: String,
    pub action: String,
    pub project_id: Option<String>,
    pub environment: String,
    pub resource_ref: String,
    pub estimated_monthly_delta_usd: String,
    pub estimated_hourly_delta_usd: String,
    pub requester_id: String,
}

/// The envelope every `gate/*` route returns, per the external interface
/// contract: `decision_id`, `status`, `reason_code`, `computed_context`,
/// `entitlement_waterfall`, an optional `approval_request_id`, the fixed
/// `approval_token_contract`, and the policy/mode lineage fields.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecisionResponse {
    pub decision_id: Uuid,
    pub status: String,
    pub reason_code: String,
    pub computed_context: ComputedContext,
    pub entitlement_waterfall: WaterfallOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<Uuid>,
    pub approval_token_contract: &'static str,
    pub policy_version: i64,
    pub policy_document_sha256: String,
    pub mode_scope: ModeScope,
}

impl From<Decision> for GateDecisionResponse {
    fn from(decision: Decision) -> Self {
        Self {
            decision_id: decision.id,
            status: decision.status.as_str().to_string(),
            reason_code: decision.reason_code,
            computed_context: decision.computed_context,
            entitlement_waterfall: decision.entitlement_waterfall,
            approval_request_id: decision.approval_request_id,
            approval_token_contract: "approval_flow_only",
            policy_version: decision.policy_version,
            policy_document_sha256: decision.policy_document_sha256,
            mode_scope: decision.mode_scope,
        }
    }
}
