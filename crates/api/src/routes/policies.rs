//! The policy document admin surface: publish a new policy version, read the
//! tenant's currently active one.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use enforcement_core::policy::{PolicyDocument, PolicyStore};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PutPolicyRequest {
    pub tenant_id: String,
    /// Raw policy document JSON, exactly as defined in the data model
    /// (monetary fields as decimal strings, never JSON numbers).
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PutPolicyResponse {
    pub tenant_id: String,
    pub policy_version: i64,
    pub sha256_hash: String,
}

/// Publish a new policy version for a tenant (or the global fallback).
#[utoipa::path(
    post,
    path = "/api/v1/enforcement/policies",
    tag = "policies",
    responses(
        (status = 200, description = "Newly assigned policy_version and content hash"),
        (status = 422, description = "Payload fails canonicalization or materialization"),
    )
)]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PutPolicyRequest>,
) -> Result<Json<PutPolicyResponse>> {
    let raw = serde_json::to_string(&req.payload)
        .map_err(|e| crate::error::ApiError::BadRequest(format!("invalid policy payload: {e}")))?;
    let (policy_version, sha256_hash) = state.policy_store.put(&req.tenant_id, &raw).await?;
    Ok(Json(PutPolicyResponse { tenant_id: req.tenant_id, policy_version, sha256_hash }))
}

#[derive(Debug, Deserialize)]
pub struct GetPolicyParams {
    pub tenant_id: String,
}

#[derive(Debug, Serialize)]
pub struct PolicyView {
    pub schema_version: u32,
    pub policy_version: i64,
    pub sha256_hash: String,
    pub terraform_mode_prod: String,
    pub terraform_mode_nonprod: String,
    pub k8s_mode_prod: String,
    pub k8s_mode_nonprod: String,
    pub plan_monthly_ceiling_usd: String,
    pub enterprise_monthly_ceiling_usd: String,
    pub approval_routing_rule_count: usize,
    pub requester_reviewer_separation_prod: bool,
    pub requester_reviewer_separation_nonprod: bool,
}

impl From<PolicyDocument> for PolicyView {
    fn from(doc: PolicyDocument) -> Self {
        Self {
            schema_version: doc.schema_version,
            policy_version: doc.policy_version,
            sha256_hash: doc.sha256_hash,
            terraform_mode_prod: doc.terraform_mode_prod.as_str().to_string(),
            terraform_mode_nonprod: doc.terraform_mode_nonprod.as_str().to_string(),
            k8s_mode_prod: doc.k8s_mode_prod.as_str().to_string(),
            k8s_mode_nonprod: doc.k8s_mode_nonprod.as_str().to_string(),
            plan_monthly_ceiling_usd: enforcement_core::money::to_canonical_string(doc.plan_monthly_ceiling_usd),
            enterprise_monthly_ceiling_usd: enforcement_core::money::to_canonical_string(doc.enterprise_monthly_ceiling_usd),
            approval_routing_rule_count: doc.approval_routing_rules.len(),
            requester_reviewer_separation_prod: doc.requester_reviewer_separation.prod,
            requester_reviewer_separation_nonprod: doc.requester_reviewer_separation.nonprod,
        }
    }
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GetPolicyParams>,
) -> Result<Json<PolicyView>> {
    let doc = state.policy_store.get_active(&params.tenant_id).await?;
    Ok(Json(doc.into()))
}
