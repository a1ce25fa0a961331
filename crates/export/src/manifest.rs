//! Manifest construction, canonical hashing, and HMAC signing for the
//! export bundle.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::source::{DecisionRow, Window};

#[derive(Debug, Clone, Serialize)]
pub struct ManifestMetadata {
    pub tenant_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub decision_count: usize,
    pub approval_count: usize,
    pub reservation_count: usize,
    pub ledger_count: usize,
    pub decisions_sha256: String,
    pub approvals_sha256: String,
    pub reservations_sha256: String,
    pub ledger_sha256: String,
    pub policy_lineage_sha256: String,
    pub policy_lineage_entries: usize,
    pub computed_context_lineage_sha256: String,
    pub computed_context_lineage_entries: usize,
    pub kid: String,
}

/// A lineage digest paired with the number of distinct buckets it was
/// computed over — the bucket count is cheap to compare against an
/// independently-recomputed one without re-deriving the hash, so callers
/// doing an anti-tamper check can report both.
pub struct Lineage {
    pub sha256: String,
    pub entries: usize,
}

/// `(policy_version, policy_document_sha256, decision_count_in_window)`,
/// sorted deterministically, then hashed as a canonical JSON array.
pub fn policy_lineage(decisions: &[DecisionRow]) -> Lineage {
    let mut buckets: BTreeMap<(i64, String), usize> = BTreeMap::new();
    for d in decisions {
        *buckets
            .entry((d.policy_version, d.policy_document_sha256.clone()))
            .or_insert(0) += 1;
    }
    let entries = buckets.len();
    let rows: Vec<_> = buckets
        .into_iter()
        .map(|((version, hash), count)| {
            serde_json::json!({
                "policy_version": version,
                "policy_document_sha256": hash,
                "decision_count_in_window": count,
            })
        })
        .collect();
    Lineage { sha256: sha256_of_canonical(&rows), entries }
}

/// `(context_version, month_window, data_source_mode)` buckets and counts,
/// sorted deterministically, then hashed as a canonical JSON array.
pub fn computed_context_lineage(decisions: &[DecisionRow]) -> Lineage {
    let mut buckets: BTreeMap<(i32, String, String, String), usize> = BTreeMap::new();
    for d in decisions {
        let key = (
            d.computed_context_version,
            d.month_start.to_string(),
            d.month_end.to_string(),
            d.data_source_mode.clone(),
        );
        *buckets.entry(key).or_insert(0) += 1;
    }
    let entries = buckets.len();
    let rows: Vec<_> = buckets
        .into_iter()
        .map(|((version, start, end, mode), count)| {
            serde_json::json!({
                "context_version": version,
                "month_start": start,
                "month_end": end,
                "data_source_mode": mode,
                "count": count,
            })
        })
        .collect();
    Lineage { sha256: sha256_of_canonical(&rows), entries }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    use std::fmt::Write;
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn sha256_of_canonical(value: &impl Serialize) -> String {
    let bytes = canonical_json_bytes(value);
    sha256_hex(&bytes)
}

/// Serializes through `serde_json::Value` so object keys land in the
/// library's `BTreeMap`-backed order and whitespace is always minimal —
/// the same canonicalization approach as the policy document hash.
pub fn canonical_json_bytes(value: &impl Serialize) -> Vec<u8> {
    let as_value: serde_json::Value = serde_json::to_value(value).expect("manifest values always serialize");
    serde_json::to_vec(&as_value).expect("canonical value always serializes")
}

pub fn hmac_sign(payload: &[u8], secret: &str) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

pub fn hmac_verify(payload: &[u8], signature_b64: &str, secret: &str) -> bool {
    type HmacSha256 = Hmac<Sha256>;
    let Ok(expected) = URL_SAFE_NO_PAD.decode(signature_b64) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

pub fn window_from(start: DateTime<Utc>, end: DateTime<Utc>) -> Window {
    Window { start, end }
}
