//! Integration tests for `EnforcementClient` against a mocked gate API.

use enforcement_sdk::client::{EnforcementClient, RetryConfig};
use enforcement_sdk::error::SdkError;
use enforcement_sdk::types::{GateRequest, TerraformPreflightRequest, TerraformStage};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gate_request() -> GateRequest {
    GateRequest {
        tenant_id: "tenant-1".into(),
        idempotency_key: "idem-1".into(),
        action: "create".into(),
        project_id: Some("p-alpha".into()),
        environment: "nonprod".into(),
        resource_ref: "aws_instance.web".into(),
        estimated_monthly_delta_usd: "300.000000".into(),
        estimated_hourly_delta_usd: "0.420000".into(),
        requester_id: "user-1".into(),
    }
}

fn allow_body() -> serde_json::Value {
    serde_json::json!({
        "decision_id": "11111111-1111-1111-1111-111111111111",
        "status": "ALLOW",
        "reason_code": "ok",
        "computed_context": {},
        "entitlement_waterfall": [],
        "approval_request_id": null,
        "approval_token_contract": "approval_flow_only",
        "policy_version": 1,
        "policy_document_sha256": "abc123",
        "mode_scope": "terraform_mode_nonprod"
    })
}

#[tokio::test]
async fn gate_allow_round_trips() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/enforcement/gate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(allow_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = EnforcementClient::new(server.uri());
    let decision = client.gate(&gate_request()).await.expect("gate call should succeed");

    assert_eq!(decision.status, "ALLOW");
    assert!(decision.is_allow());
    assert!(!decision.requires_approval());
    assert_eq!(decision.approval_token_contract, "approval_flow_only");
}

#[tokio::test]
async fn gate_idempotency_conflict_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/enforcement/gate"))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
            "error": "idempotency key reused with a different request_fingerprint",
            "reason_code": "idempotency_conflict"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = EnforcementClient::new(server.uri());
    let err = client.gate(&gate_request()).await.unwrap_err();

    match err {
        SdkError::Gate { status, reason_code, .. } => {
            assert_eq!(status, 409);
            assert_eq!(reason_code, "idempotency_conflict");
        }
        other => panic!("expected Gate error, got {other:?}"),
    }
}

#[tokio::test]
async fn gate_lock_timeout_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/enforcement/gate"))
        .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
            "error": "reservation lock timed out",
            "reason_code": "gate_lock_timeout"
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/enforcement/gate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(allow_body()))
        .mount(&server)
        .await;

    let client = EnforcementClient::with_retry_config(
        server.uri(),
        RetryConfig { max_retries: 5, initial_delay_ms: 1, max_delay_ms: 5, backoff_multiplier: 2.0 },
    );
    let decision = client.gate(&gate_request()).await.expect("should eventually succeed");
    assert_eq!(decision.status, "ALLOW");
}

#[tokio::test]
async fn terraform_preflight_returns_poll_url() {
    let server = MockServer::start().await;
    let mut body = allow_body();
    body["poll_url"] = serde_json::json!("/api/v1/enforcement/ledger?decision_id=11111111-1111-1111-1111-111111111111");
    body["approval_request_id"] = serde_json::json!(null);

    Mock::given(method("POST"))
        .and(path("/api/v1/enforcement/gate/terraform/preflight"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let client = EnforcementClient::new(server.uri());
    let resp = client
        .terraform_preflight(&TerraformPreflightRequest {
            tenant_id: "tenant-1".into(),
            run_id: "run-42".into(),
            stage: TerraformStage::Plan,
            resource_addr: "aws_instance.web".into(),
            action: "create".into(),
            project_id: Some("p-alpha".into()),
            environment: "nonprod".into(),
            estimated_cost_delta_usd_monthly: "300.000000".into(),
            estimated_cost_delta_usd_hourly: "0.420000".into(),
            expected_request_fingerprint: None,
            requester_id: "user-1".into(),
        })
        .await
        .expect("preflight should succeed");

    assert!(resp.poll_url.contains("decision_id="));
    assert_eq!(resp.decision.status, "ALLOW");
}
