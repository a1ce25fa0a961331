//! Policy document canonicalization, hashing, and the
//! materialized scalar view decisions are evaluated against.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::failsafe::Mode;

/// One routing rule from `approval_routing_rules`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingRule {
    pub id: String,
    pub env: String,
    pub action_prefix: String,
    /// Monthly delta threshold, as a canonical decimal string (e.g. "500.000000").
    pub monthly_delta_threshold: String,
    pub risk_level: String,
    pub allowed_reviewer_roles: Vec<String>,
    pub quorum: u8,
}

impl RoutingRule {
    pub fn threshold(&self) -> Result<Decimal> {
        self.monthly_delta_threshold
            .parse()
            .map_err(|_| CoreError::InvariantViolation(format!(
                "routing rule {} has non-decimal threshold", self.id
            )))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequesterReviewerSeparation {
    pub prod: bool,
    pub nonprod: bool,
}

/// Materialized, scalar view of a policy document. `canonical_payload`
/// remains the single source of truth; every field here is derived from it
/// by [`materialize`] at `put` time.
#[derive(Debug, Clone)]
pub struct PolicyDocument {
    pub schema_version: u32,
    pub policy_version: i64,
    pub canonical_payload: Vec<u8>,
    pub sha256_hash: String,
    pub terraform_mode_prod: Mode,
    pub terraform_mode_nonprod: Mode,
    pub k8s_mode_prod: Mode,
    pub k8s_mode_nonprod: Mode,
    pub plan_monthly_ceiling_usd: Decimal,
    pub enterprise_monthly_ceiling_usd: Decimal,
    pub approval_routing_rules: Vec<RoutingRule>,
    pub requester_reviewer_separation: RequesterReviewerSeparation,
    pub action_max_attempts: u32,
    pub action_retry_backoff_seconds: u32,
    pub action_lease_ttl_seconds: u32,
}

/// Canonicalizes a policy payload: parses it, relies on `serde_json::Value`'s
/// default `BTreeMap`-backed object representation to sort keys
/// lexicographically, and re-serializes compactly (no insignificant
/// whitespace). The result is stable across platforms because monetary
/// fields are required to already be decimal strings, never JSON numbers.
pub fn canonicalize(raw: &str) -> Result<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| CoreError::InvalidRequest(format!("invalid policy payload JSON: {e}")))?;
    serde_json::to_vec(&value)
        .map_err(|e| CoreError::InvalidRequest(format!("failed to canonicalize payload: {e}")))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Materializes scalar fields from a canonicalized payload. `put` is
/// authoritative: these fields are never hand-maintained separately from the
/// payload that produced them.
pub fn materialize(
    canonical_payload: &[u8],
    policy_version: i64,
) -> Result<PolicyDocument> {
    let value: serde_json::Value = serde_json::from_slice(canonical_payload)
        .map_err(|e| CoreError::InvalidRequest(format!("invalid canonical payload: {e}")))?;

    let schema_version = field_u64(&value, "schema_version")? as u32;
    let terraform_mode_prod = field_mode(&value, "terraform_mode_prod")?;
    let terraform_mode_nonprod = field_mode(&value, "terraform_mode_nonprod")?;
    let k8s_mode_prod = field_mode(&value, "k8s_mode_prod")?;
    let k8s_mode_nonprod = field_mode(&value, "k8s_mode_nonprod")?;
    let plan_monthly_ceiling_usd = field_decimal(&value, "plan_monthly_ceiling_usd")?;
    let enterprise_monthly_ceiling_usd = field_decimal(&value, "enterprise_monthly_ceiling_usd")?;
    let requester_reviewer_separation = field_separation(&value)?;
    let action_max_attempts = field_u64(&value, "action_max_attempts")? as u32;
    let action_retry_backoff_seconds = field_u64(&value, "action_retry_backoff_seconds")? as u32;
    let action_lease_ttl_seconds = field_u64(&value, "action_lease_ttl_seconds")? as u32;

    let approval_routing_rules: Vec<RoutingRule> = value
        .get("approval_routing_rules")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| CoreError::InvalidRequest(format!("invalid approval_routing_rules: {e}")))?
        .unwrap_or_default();

    let sha256_hash = sha256_hex(canonical_payload);

    Ok(PolicyDocument {
        schema_version,
        policy_version,
        canonical_payload: canonical_payload.to_vec(),
        sha256_hash,
        terraform_mode_prod,
        terraform_mode_nonprod,
        k8s_mode_prod,
        k8s_mode_nonprod,
        plan_monthly_ceiling_usd,
        enterprise_monthly_ceiling_usd,
        approval_routing_rules,
        requester_reviewer_separation,
        action_max_attempts,
        action_retry_backoff_seconds,
        action_lease_ttl_seconds,
    })
}

fn field_u64(value: &serde_json::Value, key: &str) -> Result<u64> {
    value
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| CoreError::InvalidRequest(format!("missing or non-integer field: {key}")))
}

fn field_decimal(value: &serde_json::Value, key: &str) -> Result<Decimal> {
    let raw = value
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRequest(format!("missing or non-string monetary field: {key}")))?;
    raw.parse::<Decimal>()
        .map(crate::money::normalize)
        .map_err(|_| CoreError::InvalidRequest(format!("field {key} is not a valid decimal")))
}

fn field_mode(value: &serde_json::Value, key: &str) -> Result<Mode> {
    let raw = value
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRequest(format!("missing mode field: {key}")))?;
    match raw.to_uppercase().as_str() {
        "SHADOW" => Ok(Mode::Shadow),
        "SOFT" => Ok(Mode::Soft),
        "HARD" => Ok(Mode::Hard),
        other => Err(CoreError::InvalidRequest(format!("unknown mode for {key}: {other}"))),
    }
}

fn field_separation(value: &serde_json::Value) -> Result<RequesterReviewerSeparation> {
    let obj = value
        .get("requester_reviewer_separation")
        .ok_or_else(|| CoreError::InvalidRequest("missing requester_reviewer_separation".into()))?;
    serde_json::from_value(obj.clone())
        .map_err(|e| CoreError::InvalidRequest(format!("invalid requester_reviewer_separation: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> String {
        serde_json::json!({
            "schema_version": 1,
            "terraform_mode_prod": "HARD",
            "terraform_mode_nonprod": "SOFT",
            "k8s_mode_prod": "HARD",
            "k8s_mode_nonprod": "SOFT",
            "plan_monthly_ceiling_usd": "5000.000000",
            "enterprise_monthly_ceiling_usd": "50000.000000",
            "approval_routing_rules": [],
            "requester_reviewer_separation": {"prod": true, "nonprod": false},
            "action_max_attempts": 5,
            "action_retry_backoff_seconds": 30,
            "action_lease_ttl_seconds": 300
        })
        .to_string()
    }

    #[test]
    fn canonical_hash_is_stable_under_key_reordering() {
        let a = canonicalize(&sample_payload()).unwrap();
        // Same fields, different source order + extra whitespace.
        let reordered = r#"{
            "action_lease_ttl_seconds": 300,
            "schema_version": 1,
            "enterprise_monthly_ceiling_usd": "50000.000000",
            "terraform_mode_prod": "HARD",
            "terraform_mode_nonprod": "SOFT",
            "k8s_mode_prod": "HARD",
            "k8s_mode_nonprod": "SOFT",
            "plan_monthly_ceiling_usd": "5000.000000",
            "approval_routing_rules": [],
            "requester_reviewer_separation": {"nonprod": false, "prod": true},
            "action_max_attempts": 5,
            "action_retry_backoff_seconds": 30
        }"#;
        let b = canonicalize(reordered).unwrap();
        assert_eq!(sha256_hex(&a), sha256_hex(&b));
    }

    #[test]
    fn materialize_parses_known_fields() {
        let canonical = canonicalize(&sample_payload()).unwrap();
        let doc = materialize(&canonical, 1).unwrap();
        assert_eq!(doc.schema_version, 1);
        assert_eq!(doc.terraform_mode_prod, Mode::Hard);
        assert_eq!(doc.plan_monthly_ceiling_usd, Decimal::new(5_000_000_000, 6));
        assert!(doc.requester_reviewer_separation.prod);
        assert!(!doc.requester_reviewer_separation.nonprod);
    }

    #[test]
    fn materialize_rejects_float_monetary_field() {
        let bad = serde_json::json!({
            "schema_version": 1,
            "terraform_mode_prod": "HARD",
            "terraform_mode_nonprod": "SOFT",
            "k8s_mode_prod": "HARD",
            "k8s_mode_nonprod": "SOFT",
            "plan_monthly_ceiling_usd": 5000.0,
            "enterprise_monthly_ceiling_usd": "50000.000000",
            "approval_routing_rules": [],
            "requester_reviewer_separation": {"prod": true, "nonprod": false},
            "action_max_attempts": 5,
            "action_retry_backoff_seconds": 30,
            "action_lease_ttl_seconds": 300
        })
        .to_string();
        let canonical = canonicalize(&bad).unwrap();
        assert!(materialize(&canonical, 1).is_err());
    }
}
