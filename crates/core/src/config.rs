//! Environment-driven configuration for the enforcement core.
//!
//! Loaded once at process start via [`EnforcementConfig::from_env`]. Mirrors
//! the `config`-crate pattern used throughout the indexer: a flat struct with
//! `#[serde(default = "...")]` fallbacks, built from `config::Environment`.

use serde::Deserialize;
use std::time::Duration;

use crate::failsafe::Mode;

#[derive(Debug, Clone, Deserialize)]
pub struct EnforcementConfig {
    /// Postgres connection string.
    pub database_url: String,

    /// Maximum number of connections in the pool (env: `DB_MAX_CONNECTIONS`).
    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,

    /// Minimum idle connections maintained (env: `DB_MIN_CONNECTIONS`).
    #[serde(default = "default_min_connections")]
    pub db_min_connections: u32,

    /// Seconds to wait for a pooled connection (env: `DB_CONNECTION_TIMEOUT`).
    #[serde(default = "default_connection_timeout_secs")]
    pub db_connection_timeout_secs: u64,

    /// Idle connection timeout in seconds (env: `DB_IDLE_TIMEOUT`).
    #[serde(default = "default_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// Maximum lifetime of a pooled connection in seconds (env: `DB_MAX_LIFETIME`).
    #[serde(default = "default_max_lifetime_secs")]
    pub db_max_lifetime_secs: u64,

    /// HMAC secret used to sign approval tokens.
    pub enforcement_approval_token_secret: String,

    /// Comma-separated list of rotation-fallback secrets for token verification.
    #[serde(default)]
    pub enforcement_approval_token_fallback_secrets: String,

    /// HMAC secret used to sign export manifests.
    pub enforcement_export_signing_secret: String,

    /// Key id recorded on export manifest signatures.
    #[serde(default = "default_export_signing_kid")]
    pub enforcement_export_signing_kid: String,

    /// Per-request gate evaluation deadline in seconds.
    #[serde(default = "default_gate_timeout_secs")]
    pub enforcement_gate_timeout_seconds: u64,

    /// Cross-tenant requests-per-minute cap for `/gate/*`.
    #[serde(default = "default_global_gate_cap")]
    pub enforcement_global_gate_per_minute_cap: u32,

    /// Whether the cross-tenant abuse guard is active at all.
    #[serde(default = "default_true")]
    pub enforcement_global_abuse_guard_enabled: bool,

    /// Milliseconds to wait for a tenant+source reservation lock before
    /// falling back to FAIL_SAFE.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Risk score at or above which the decision engine routes to
    /// REQUIRE_APPROVAL even when the waterfall itself would allow.
    #[serde(default = "default_risk_require_approval_threshold")]
    pub enforcement_risk_require_approval_threshold: f64,

    /// `1 - target_availability` for the gate's SLO (e.g. `0.001` for a
    /// 99.9% target), the denominator of `error_budget_burn_ratio_*`.
    #[serde(default = "default_slo_error_budget")]
    pub enforcement_slo_error_budget: f64,

    /// Fail-safe mode matrix keys, e.g. `TERRAFORM_MODE_PROD=HARD`.
    #[serde(default = "default_terraform_mode_prod")]
    pub terraform_mode_prod: Mode,
    #[serde(default = "default_terraform_mode_nonprod")]
    pub terraform_mode_nonprod: Mode,
    #[serde(default = "default_k8s_mode_prod")]
    pub k8s_admission_mode_prod: Mode,
    #[serde(default = "default_k8s_mode_nonprod")]
    pub k8s_admission_mode_nonprod: Mode,
    #[serde(default = "default_cloud_event_mode")]
    pub cloud_event_mode: Mode,
    #[serde(default = "default_generic_mode")]
    pub generic_mode: Mode,
}

fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    2
}
fn default_connection_timeout_secs() -> u64 {
    30
}
fn default_idle_timeout_secs() -> u64 {
    600
}
fn default_max_lifetime_secs() -> u64 {
    1800
}
fn default_export_signing_kid() -> String {
    "export-v1".to_string()
}
fn default_gate_timeout_secs() -> u64 {
    2
}
fn default_global_gate_cap() -> u32 {
    6000
}
fn default_true() -> bool {
    true
}
fn default_lock_wait_ms() -> u64 {
    250
}
fn default_risk_require_approval_threshold() -> f64 {
    0.75
}
fn default_slo_error_budget() -> f64 {
    0.001
}
fn default_terraform_mode_prod() -> Mode {
    Mode::Hard
}
fn default_terraform_mode_nonprod() -> Mode {
    Mode::Soft
}
fn default_k8s_mode_prod() -> Mode {
    Mode::Hard
}
fn default_k8s_mode_nonprod() -> Mode {
    Mode::Soft
}
fn default_cloud_event_mode() -> Mode {
    Mode::Soft
}
fn default_generic_mode() -> Mode {
    Mode::Shadow
}

impl EnforcementConfig {
    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        cfg.try_deserialize()
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.enforcement_gate_timeout_seconds)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Rotation-fallback secrets, deduplicated and order-preserving.
    pub fn token_fallback_secrets(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.enforcement_approval_token_fallback_secrets
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupes_fallback_secrets() {
        let mut cfg = sample_config();
        cfg.enforcement_approval_token_fallback_secrets = "a,b,a, ,b".to_string();
        assert_eq!(cfg.token_fallback_secrets(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_fallback_list_is_empty() {
        let cfg = sample_config();
        assert!(cfg.token_fallback_secrets().is_empty());
    }

    fn sample_config() -> EnforcementConfig {
        EnforcementConfig {
            database_url: "postgres://localhost/test".to_string(),
            db_max_connections: default_max_connections(),
            db_min_connections: default_min_connections(),
            db_connection_timeout_secs: default_connection_timeout_secs(),
            db_idle_timeout_secs: default_idle_timeout_secs(),
            db_max_lifetime_secs: default_max_lifetime_secs(),
            enforcement_approval_token_secret: "secret".to_string(),
            enforcement_approval_token_fallback_secrets: String::new(),
            enforcement_export_signing_secret: "export-secret".to_string(),
            enforcement_export_signing_kid: default_export_signing_kid(),
            enforcement_gate_timeout_seconds: default_gate_timeout_secs(),
            enforcement_global_gate_per_minute_cap: default_global_gate_cap(),
            enforcement_global_abuse_guard_enabled: true,
            lock_wait_ms: default_lock_wait_ms(),
            enforcement_risk_require_approval_threshold: default_risk_require_approval_threshold(),
            enforcement_slo_error_budget: default_slo_error_budget(),
            terraform_mode_prod: Mode::Hard,
            terraform_mode_nonprod: Mode::Soft,
            k8s_admission_mode_prod: Mode::Hard,
            k8s_admission_mode_nonprod: Mode::Soft,
            cloud_event_mode: Mode::Soft,
            generic_mode: Mode::Shadow,
        }
    }
}
