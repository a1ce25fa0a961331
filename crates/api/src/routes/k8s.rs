//! Kubernetes admission adapters: the legacy generic gate shape and the
//! native `AdmissionReview` v1 contract, returned verbatim per the
//! Kubernetes webhook convention (`response.uid` echoes `request.uid`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use enforcement_core::decision::{DecisionInput, Environment, Source};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, Result};
use crate::routes::gate::{self, fingerprint, parse_money};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AdmissionReview {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub request: AdmissionRequest,
}

#[derive(Debug, Deserialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: String,
    pub resource: AdmissionResource,
    pub namespace: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub object: Value,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct AdmissionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Debug, Serialize)]
pub struct AdmissionReviewResponse {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    pub status: AdmissionStatus,
    pub warnings: Vec<String>,
    #[serde(rename = "auditAnnotations")]
    pub audit_annotations: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct AdmissionStatus {
    pub code: u16,
    pub message: String,
}

fn map_operation(operation: &str) -> String {
    operation.to_lowercase()
}

fn annotation_decimal(
    annotations: &HashMap<String, String>,
    key: &str,
) -> Result<rust_decimal::Decimal> {
    match annotations.get(key) {
        Some(raw) => parse_money(key, raw),
        None => Ok(rust_decimal::Decimal::ZERO),
    }
}

fn resource_ref(req: &AdmissionRequest) -> String {
    format!(
        "{}/{}/{}/{}",
        req.resource.group,
        req.resource.version,
        req.resource.resource,
        req.name.clone().unwrap_or_else(|| "unnamed".to_string())
    )
}

/// `tenant_id` for a Kubernetes object is read from the
/// `valdrix.io/tenant-id` annotation, falling back to the namespace: the
/// namespace is the project, and an explicit annotation overrides it.
fn tenant_id_for(req: &AdmissionRequest) -> Result<String> {
    req.annotations
        .get("valdrix.io/tenant-id")
        .cloned()
        .or_else(|| req.namespace.clone())
        .ok_or_else(|| ApiError::BadRequest("admission request has neither a tenant annotation nor a namespace".into()))
}

pub async fn handle_admission_review(
    State(state): State<Arc<AppState>>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReviewResponse> {
    let uid = review.request.uid.clone();
    match evaluate_admission(&state, review.request).await {
        Ok((decision_status, reason_code)) => Json(AdmissionReviewResponse {
            api_version: review.api_version,
            kind: review.kind,
            response: AdmissionResponse {
                uid,
                allowed: decision_status,
                status: AdmissionStatus { code: if decision_status { 200 } else { 403 }, message: reason_code.clone() },
                warnings: Vec::new(),
                audit_annotations: HashMap::from([("reason_code".to_string(), reason_code)]),
            },
        }),
        Err(err) => Json(AdmissionReviewResponse {
            api_version: review.api_version,
            kind: review.kind,
            response: AdmissionResponse {
                uid,
                allowed: false,
                status: AdmissionStatus { code: err.status().as_u16(), message: err.to_string() },
                warnings: Vec::new(),
                audit_annotations: HashMap::from([("reason_code".to_string(), err.reason_code().to_string())]),
            },
        }),
    }
}

async fn evaluate_admission(state: &AppState, req: AdmissionRequest) -> Result<(bool, String)> {
    let monthly = annotation_decimal(&req.annotations, "valdrix.io/cost-monthly-usd")?;
    let hourly = annotation_decimal(&req.annotations, "valdrix.io/cost-hourly-usd")?;
    let action = map_operation(&req.operation);
    let tenant_id = tenant_id_for(&req)?;
    let project_id = req.namespace.clone();
    let environment = req.annotations.get("valdrix.io/environment").cloned().unwrap_or_else(|| "nonprod".to_string());
    let resource_ref_value = resource_ref(&req);
    let requester_id = req.annotations.get("valdrix.io/requester").cloned().unwrap_or_else(|| "k8s-admission-controller".to_string());

    let fp = fingerprint(&tenant_id, &action, project_id.as_deref(), &environment, &resource_ref_value, monthly, hourly);

    let input = DecisionInput {
        tenant_id,
        source: Source::K8sAdmission,
        idempotency_key: format!("k8s:{}", req.uid),
        request_fingerprint: fp,
        action,
        project_id,
        environment: Environment::new(environment),
        resource_ref: resource_ref_value,
        estimated_monthly_delta_usd: monthly,
        estimated_hourly_delta_usd: hourly,
        requester_id,
    };

    let Json(decision) = gate::evaluate(state, Source::K8sAdmission, "gate.k8s", input).await?;
    Ok((decision.status == "ALLOW" || decision.status == "ALLOW_WITH_CREDITS" || decision.status == "FAIL_SAFE_ALLOW", decision.reason_code))
}

/// Legacy, non-native K8s gate shape: a flat JSON body rather than a full
/// `AdmissionReview` envelope. Proxies straight to the generic adapter.
pub async fn handle_legacy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<crate::models::GateRequest>,
) -> Result<Json<crate::models::GateDecisionResponse>> {
    crate::routes::gate::handle_generic(State(state), Json(req)).await
}
