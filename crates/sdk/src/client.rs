//! HTTP client for the enforcement gate API.

use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SdkError};
use crate::types::{
    CloudEventRequest, ConsumeTokenRequest, ConsumeTokenResponse, DecisionView, ErrorBody,
    GateDecisionResponse, GateRequest, TerraformPreflightRequest, TerraformPreflightResponse,
};

/// Retry configuration for gate calls: exponential backoff capped at
/// `max_delay_ms`.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Thin client for the `/api/v1/enforcement` HTTP surface. Holds no
/// server-side state; every call is a single synchronous round trip, mirroring
/// the gate's own synchronous-per-request contract.
#[derive(Clone)]
pub struct EnforcementClient {
    base_url: String,
    http: reqwest::Client,
    retry_config: RetryConfig,
}

impl EnforcementClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_retry_config(base_url, RetryConfig::default())
    }

    pub fn with_retry_config(base_url: impl Into<String>, retry_config: RetryConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            retry_config,
        }
    }

    async fn retry<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut delay_ms = self.retry_config.initial_delay_ms;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= self.retry_config.max_retries {
                        warn!("enforcement gate call failed after {} attempts: {}", attempt, e);
                        return Err(e);
                    }
                    debug!(
                        "enforcement gate call failed (attempt {}/{}), retrying in {}ms: {}",
                        attempt, self.retry_config.max_retries, delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = ((delay_ms as f64) * self.retry_config.backoff_multiplier) as u64;
                    delay_ms = delay_ms.min(self.retry_config.max_delay_ms);
                }
            }
        }
    }

    async fn post_json<Req: serde::Serialize + Sync, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.post(&url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let err_body = resp.json::<ErrorBody>().await.unwrap_or(ErrorBody {
                error: format!("gate call to {path} failed with status {status}"),
                reason_code: "unknown".to_string(),
            });
            return Err(SdkError::Gate { status: status.as_u16(), reason_code: err_body.reason_code, message: err_body.error });
        }
        resp.json::<Resp>().await.map_err(|e| SdkError::InvalidResponse(e.to_string()))
    }

    /// `POST /api/v1/enforcement/gate` — generic gate adapter.
    pub async fn gate(&self, request: &GateRequest) -> Result<GateDecisionResponse> {
        self.retry(|| self.post_json("/api/v1/enforcement/gate", request)).await
    }

    /// `POST /api/v1/enforcement/gate/terraform/preflight` — run/stage-aware
    /// preflight. The caller provides a stable `run_id`/`stage` so retries of
    /// the same `terraform plan`/`apply` step replay the original decision
    /// instead of minting a new one.
    pub async fn terraform_preflight(&self, request: &TerraformPreflightRequest) -> Result<TerraformPreflightResponse> {
        self.retry(|| self.post_json("/api/v1/enforcement/gate/terraform/preflight", request)).await
    }

    /// `POST /api/v1/enforcement/gate/cloud-event` — CloudEvents v1.0
    /// envelope; idempotency defaults to `cloudevent:{id}` server-side.
    pub async fn cloud_event(&self, request: &CloudEventRequest) -> Result<GateDecisionResponse> {
        self.retry(|| self.post_json("/api/v1/enforcement/gate/cloud-event", request)).await
    }

    /// `POST /api/v1/enforcement/approvals/consume` — one-time approval
    /// token redemption. Never retried automatically: a failed consume may
    /// already have flipped the approval to `CONSUMED`, and blindly retrying
    /// a non-idempotent state transition would manufacture a spurious
    /// `token_already_consumed` failure on the caller's own first success.
    pub async fn consume_approval_token(&self, request: &ConsumeTokenRequest) -> Result<ConsumeTokenResponse> {
        self.post_json("/api/v1/enforcement/approvals/consume", request).await
    }

    /// `GET /api/v1/enforcement/ledger?decision_id=...` — resolves a
    /// preflight response's `poll_url`.
    pub async fn get_decision(&self, decision_id: Uuid) -> Result<DecisionView> {
        let url = format!("{}/api/v1/enforcement/ledger?decision_id={decision_id}", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let err_body = resp.json::<ErrorBody>().await.unwrap_or(ErrorBody {
                error: format!("ledger lookup for {decision_id} failed with status {status}"),
                reason_code: "unknown".to_string(),
            });
            return Err(SdkError::Gate { status: status.as_u16(), reason_code: err_body.reason_code, message: err_body.error });
        }
        resp.json::<DecisionView>().await.map_err(|e| SdkError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_strips_trailing_slash() {
        let client = EnforcementClient::new("https://ecp.internal/");
        assert_eq!(client.base_url, "https://ecp.internal");
    }

    #[test]
    fn default_retry_config_is_bounded() {
        let cfg = RetryConfig::default();
        assert!(cfg.max_retries > 0);
        assert!(cfg.initial_delay_ms <= cfg.max_delay_ms);
    }
}
