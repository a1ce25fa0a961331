//! `POST /api/v1/enforcement/gate` — the generic gate adapter every other
//! protocol-specific adapter (`terraform`, `k8s`, `cloud_event`) eventually
//! normalizes its request into. Also hosts the helpers the other adapters
//! reuse: fingerprinting and the `Decision -> GateDecisionResponse` mapping.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use enforcement_core::decision::{DecisionInput, Environment, Source};
use enforcement_core::metrics::MetricsSink;
use enforcement_core::money;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::error::{ApiError, Result};
use crate::models::{GateDecisionResponse, GateRequest};
use crate::state::AppState;

/// Deterministic fingerprint over the fields that define what was actually
/// requested. Used to detect idempotency-key reuse against a different
/// payload (`IdempotencyConflict`). Monetary fields are rendered through
/// [`money::to_canonical_string`] so platform-independent decimal
/// representations, not float formatting, drive the hash.
pub fn fingerprint(
    tenant_id: &str,
    action: &str,
    project_id: Option<&str>,
    environment: &str,
    resource_ref: &str,
    estimated_monthly_delta_usd: Decimal,
    estimated_hourly_delta_usd: Decimal,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(action.as_bytes());
    hasher.update(b"|");
    hasher.update(project_id.unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(environment.as_bytes());
    hasher.update(b"|");
    hasher.update(resource_ref.as_bytes());
    hasher.update(b"|");
    hasher.update(money::to_canonical_string(estimated_monthly_delta_usd).as_bytes());
    hasher.update(b"|");
    hasher.update(money::to_canonical_string(estimated_hourly_delta_usd).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn parse_money(label: &str, raw: &str) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .map(money::normalize)
        .map_err(|_| ApiError::BadRequest(format!("{label} is not a valid decimal amount: {raw}")))
}

pub fn source_from_str(raw: &str) -> Result<Source> {
    Source::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("unknown gate source: {raw}")))
}

pub async fn evaluate(state: &AppState, source: Source, context: &str, input: DecisionInput) -> Result<Json<GateDecisionResponse>> {
    let start = std::time::Instant::now();
    let result = state.engine.evaluate_gate(input).await;
    state.metrics.record_gate_latency_seconds(source.as_str(), start.elapsed().as_secs_f64());

    match result {
        Ok(decision) => {
            state.metrics.record_gate_decision(source.as_str(), decision.status.as_str(), &decision.reason_code);
            Ok(Json(decision.into()))
        }
        Err(enforcement_core::decision::EvaluateError::Core(core_err)) => {
            let err: ApiError = core_err.into();
            crate::routes::audit_invariant_violation(state, context, &err);
            Err(err)
        }
    }
}

/// Evaluate a generic gate request.
#[utoipa::path(
    post,
    path = "/api/v1/enforcement/gate",
    tag = "gate",
    responses(
        (status = 200, description = "Gate decision: {decision_id, status, reason_code, computed_context, entitlement_waterfall, approval_request_id?, policy_version, policy_document_sha256, mode_scope}"),
        (status = 422, description = "Invalid request payload"),
    )
)]
pub async fn handle_generic(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GateRequest>,
) -> Result<Json<GateDecisionResponse>> {
    let monthly = parse_money("estimated_monthly_delta_usd", &req.estimated_monthly_delta_usd)?;
    let hourly = parse_money("estimated_hourly_delta_usd", &req.estimated_hourly_delta_usd)?;
    let fp = fingerprint(
        &req.tenant_id,
        &req.action,
        req.project_id.as_deref(),
        &req.environment,
        &req.resource_ref,
        monthly,
        hourly,
    );

    let input = DecisionInput {
        tenant_id: req.tenant_id,
        source: Source::Generic,
        idempotency_key: req.idempotency_key,
        request_fingerprint: fp,
        action: req.action,
        project_id: req.project_id,
        environment: Environment::new(req.environment),
        resource_ref: req.resource_ref,
        estimated_monthly_delta_usd: monthly,
        estimated_hourly_delta_usd: hourly,
        requester_id: req.requester_id,
    };

    evaluate(&state, Source::Generic, "gate.generic", input).await
}
