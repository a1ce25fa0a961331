//! Signed one-time approval tokens.
//!
//! Tokens are a custom three-segment `header.payload.signature` format
//! (not a general-purpose JWT library): the header only ever carries `kid`,
//! and verification tries the current signing secret followed by each
//! configured rotation fallback, in order, stopping at the first match.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::decision::model::Environment;
use crate::error::{CoreError, Result};

pub const TOKEN_TYPE: &str = "enforcement_approval";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    pub kid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub tenant_id: String,
    pub project_id: Option<String>,
    pub environment: String,
    pub source: String,
    pub decision_id: Uuid,
    pub approval_id: Uuid,
    pub fingerprint: String,
    pub max_monthly_delta_usd: Decimal,
    pub max_hourly_delta_usd: Decimal,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub kid: String,
}

/// The request-side facts a presented token must bind to before it is
/// honored. Mismatches never surface the underlying reason beyond
/// `TokenBindingMismatch` — the caller learns "no" but not which field.
pub struct BindingContext<'a> {
    pub tenant_id: &'a str,
    pub project_id: Option<&'a str>,
    pub environment: &'a Environment,
    pub source: &'a str,
    pub decision_id: Uuid,
    pub fingerprint: &'a str,
    pub requested_monthly_delta_usd: Decimal,
    pub requested_hourly_delta_usd: Decimal,
}

pub struct TokenSigner {
    current_kid: String,
    current_secret: String,
    fallback_secrets: Vec<String>,
}

impl TokenSigner {
    pub fn new(kid: impl Into<String>, current_secret: impl Into<String>, fallback_secrets: Vec<String>) -> Self {
        Self {
            current_kid: kid.into(),
            current_secret: current_secret.into(),
            fallback_secrets,
        }
    }

    pub fn issue(&self, claims: &TokenClaims) -> Result<String> {
        let mut claims = claims.clone();
        claims.kid = self.current_kid.clone();
        claims.token_type = TOKEN_TYPE.to_string();
        encode(&claims, &self.current_secret)
    }

    /// Verifies signature and expiry only. Callers must separately check
    /// `verify_binding` and single-use consumption.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let (header_b64, payload_b64, signature_b64) = split_segments(token)?;
        let header: TokenHeader = decode_segment(header_b64)?;

        let secrets = std::iter::once(self.current_secret.as_str())
            .chain(self.fallback_secrets.iter().map(String::as_str));
        let signing_input = format!("{header_b64}.{payload_b64}");
        let matched = secrets
            .into_iter()
            .any(|secret| verify_signature(&signing_input, signature_b64, secret));
        if !matched {
            return Err(CoreError::TokenInvalid("signature mismatch".into()));
        }

        let claims: TokenClaims = decode_segment(payload_b64)?;
        if claims.kid != header.kid {
            return Err(CoreError::TokenInvalid("kid mismatch between header and claims".into()));
        }
        if claims.token_type != TOKEN_TYPE {
            return Err(CoreError::TokenInvalid("unexpected token_type".into()));
        }
        if claims.expires_at <= Utc::now() {
            return Err(CoreError::TokenInvalid("token expired".into()));
        }
        Ok(claims)
    }
}

pub fn verify_binding(claims: &TokenClaims, ctx: &BindingContext<'_>) -> Result<()> {
    let ok = claims.tenant_id == ctx.tenant_id
        && claims.project_id.as_deref() == ctx.project_id
        && claims.environment.eq_ignore_ascii_case(ctx.environment.as_str())
        && claims.source == ctx.source
        && claims.decision_id == ctx.decision_id
        && claims.fingerprint == ctx.fingerprint
        && claims.max_monthly_delta_usd >= ctx.requested_monthly_delta_usd
        && claims.max_hourly_delta_usd >= ctx.requested_hourly_delta_usd;
    if ok {
        Ok(())
    } else {
        Err(CoreError::TokenBindingMismatch(
            "token does not bind to this request".into(),
        ))
    }
}

fn encode(claims: &TokenClaims, secret: &str) -> Result<String> {
    let header = TokenHeader {
        alg: "HS256".to_string(),
        kid: claims.kid.clone(),
    };
    let header_b64 = encode_segment(&header)?;
    let payload_b64 = encode_segment(claims)?;
    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature_b64 = sign(&signing_input, secret);
    Ok(format!("{header_b64}.{payload_b64}.{signature_b64}"))
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)
        .map_err(|e| CoreError::TokenInvalid(format!("failed to encode token segment: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| CoreError::TokenInvalid("malformed base64 segment".into()))?;
    serde_json::from_slice(&bytes).map_err(|_| CoreError::TokenInvalid("malformed token segment JSON".into()))
}

fn split_segments(token: &str) -> Result<(&str, &str, &str)> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => Ok((h, p, s)),
        _ => Err(CoreError::TokenInvalid("expected exactly 3 dot-separated segments".into())),
    }
}

type HmacSha256 = Hmac<Sha256>;

fn sign(signing_input: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn verify_signature(signing_input: &str, signature_b64: &str, secret: &str) -> bool {
    let Ok(expected_bytes) = URL_SAFE_NO_PAD.decode(signature_b64) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&expected_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_claims() -> TokenClaims {
        TokenClaims {
            tenant_id: "tenant-1".to_string(),
            project_id: Some("p-alpha".to_string()),
            environment: "prod".to_string(),
            source: "terraform".to_string(),
            decision_id: Uuid::new_v4(),
            approval_id: Uuid::new_v4(),
            fingerprint: "fp-123".to_string(),
            max_monthly_delta_usd: Decimal::from(500),
            max_hourly_delta_usd: Decimal::new(7, 1),
            token_type: TOKEN_TYPE.to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
            kid: String::new(),
        }
    }

    #[test]
    fn round_trips_and_verifies() {
        let signer = TokenSigner::new("kid-1", "current-secret", vec![]);
        let token = signer.issue(&sample_claims()).unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.tenant_id, "tenant-1");
        assert_eq!(claims.kid, "kid-1");
    }

    #[test]
    fn verifies_against_fallback_secret_after_rotation() {
        let old_signer = TokenSigner::new("kid-1", "old-secret", vec![]);
        let token = old_signer.issue(&sample_claims()).unwrap();
        let new_signer = TokenSigner::new("kid-2", "new-secret", vec!["old-secret".to_string()]);
        let claims = new_signer.verify(&token).unwrap();
        assert_eq!(claims.tenant_id, "tenant-1");
    }

    #[test]
    fn rejects_tampered_signature() {
        let signer = TokenSigner::new("kid-1", "current-secret", vec![]);
        let mut token = signer.issue(&sample_claims()).unwrap();
        token.push('x');
        assert!(signer.verify(&token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let signer = TokenSigner::new("kid-1", "current-secret", vec![]);
        let mut claims = sample_claims();
        claims.expires_at = Utc::now() - chrono::Duration::minutes(1);
        let token = signer.issue(&claims).unwrap();
        assert!(matches!(signer.verify(&token), Err(CoreError::TokenInvalid(_))));
    }

    #[test]
    fn binding_mismatch_on_wrong_fingerprint() {
        let signer = TokenSigner::new("kid-1", "current-secret", vec![]);
        let claims = sample_claims();
        let token = signer.issue(&claims).unwrap();
        let verified = signer.verify(&token).unwrap();
        let ctx = BindingContext {
            tenant_id: "tenant-1",
            project_id: Some("p-alpha"),
            environment: &Environment::new("prod"),
            source: "terraform",
            decision_id: verified.decision_id,
            fingerprint: "different-fingerprint",
            requested_monthly_delta_usd: Decimal::from(100),
            requested_hourly_delta_usd: Decimal::ZERO,
        };
        assert!(verify_binding(&verified, &ctx).is_err());
    }

    #[test]
    fn binding_rejects_request_exceeding_token_ceiling() {
        let signer = TokenSigner::new("kid-1", "current-secret", vec![]);
        let claims = sample_claims();
        let token = signer.issue(&claims).unwrap();
        let verified = signer.verify(&token).unwrap();
        let ctx = BindingContext {
            tenant_id: "tenant-1",
            project_id: Some("p-alpha"),
            environment: &Environment::new("prod"),
            source: "terraform",
            decision_id: verified.decision_id,
            fingerprint: "fp-123",
            requested_monthly_delta_usd: Decimal::from(999_999),
            requested_hourly_delta_usd: Decimal::ZERO,
        };
        assert!(verify_binding(&verified, &ctx).is_err());
    }
}
