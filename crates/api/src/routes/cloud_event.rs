//! `POST /api/v1/enforcement/gate/cloud-event` — CloudEvents v1.0 adapter.
//! Structured `data` carries the same fields the generic gate input expects;
//! the envelope fields (`id`, `source`, `specversion`, `type`) only drive
//! idempotency defaults and the audit fingerprint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use enforcement_core::decision::{DecisionInput, Environment, Source};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::GateDecisionResponse;
use crate::routes::gate::{self, parse_money};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: CloudEventData,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CloudEventData {
    pub tenant_id: String,
    pub action: String,
    pub project_id: Option<String>,
    pub environment: String,
    pub resource_ref: String,
    pub estimated_monthly_delta_usd: String,
    pub estimated_hourly_delta_usd: String,
    pub requester_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CloudEventGateResponse {
    #[serde(flatten)]
    pub decision: GateDecisionResponse,
    pub cloud_event_data_sha256: String,
}

fn data_sha256(raw: &serde_json::Value) -> String {
    let canonical = serde_json::to_vec(raw).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    Json(event): Json<CloudEvent>,
) -> Result<Json<CloudEventGateResponse>> {
    tracing::debug!(specversion = %event.specversion, event_type = %event.event_type, source = %event.source, "received cloud event");

    let monthly = parse_money("estimated_monthly_delta_usd", &event.data.estimated_monthly_delta_usd)?;
    let hourly = parse_money("estimated_hourly_delta_usd", &event.data.estimated_hourly_delta_usd)?;

    let data_value = serde_json::to_value(&event.data).unwrap_or(serde_json::Value::Null);
    let cloud_event_data_sha256 = data_sha256(&data_value);

    let idempotency_key = event.data.idempotency_key.clone().unwrap_or_else(|| format!("cloudevent:{}", event.id));
    let fp = gate::fingerprint(
        &event.data.tenant_id,
        &event.data.action,
        event.data.project_id.as_deref(),
        &event.data.environment,
        &event.data.resource_ref,
        monthly,
        hourly,
    );

    let input = DecisionInput {
        tenant_id: event.data.tenant_id,
        source: Source::CloudEvent,
        idempotency_key,
        request_fingerprint: fp,
        action: event.data.action,
        project_id: event.data.project_id,
        environment: Environment::new(event.data.environment),
        resource_ref: event.data.resource_ref,
        estimated_monthly_delta_usd: monthly,
        estimated_hourly_delta_usd: hourly,
        requester_id: event.data.requester_id,
    };

    let Json(decision) = gate::evaluate(&state, Source::CloudEvent, "gate.cloud_event", input).await?;
    Ok(Json(CloudEventGateResponse { decision, cloud_event_data_sha256 }))
}
