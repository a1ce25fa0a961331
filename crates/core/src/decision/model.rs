//! The `Decision` entity, its status state machine, and the
//! small value types (`Source`, `Environment`) consulted across the crate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ComputedContext;
use crate::failsafe::ModeScope;
use crate::ledger::grants::CreditAllocation;
use crate::waterfall::WaterfallOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Terraform,
    K8sAdmission,
    CloudEvent,
    Generic,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Terraform => "terraform",
            Source::K8sAdmission => "k8s_admission",
            Source::CloudEvent => "cloud_event",
            Source::Generic => "generic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "terraform" => Some(Source::Terraform),
            "k8s_admission" => Some(Source::K8sAdmission),
            "cloud_event" => Some(Source::CloudEvent),
            "generic" => Some(Source::Generic),
            _ => None,
        }
    }
}

/// Free-form environment label. Anything other than exactly `"prod"`
/// (case-insensitive) is treated as nonprod, including unrecognized values —
/// ECP never fails open on an unfamiliar environment string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment(String);

impl Environment {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn is_prod(&self) -> bool {
        self.0.eq_ignore_ascii_case("prod")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Allow,
    Deny,
    RequireApproval,
    AllowWithCredits,
    FailSafeAllow,
    FailSafeDeny,
    FailSafeRequireApproval,
}

impl DecisionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionStatus::Allow => "ALLOW",
            DecisionStatus::Deny => "DENY",
            DecisionStatus::RequireApproval => "REQUIRE_APPROVAL",
            DecisionStatus::AllowWithCredits => "ALLOW_WITH_CREDITS",
            DecisionStatus::FailSafeAllow => "FAIL_SAFE_ALLOW",
            DecisionStatus::FailSafeDeny => "FAIL_SAFE_DENY",
            DecisionStatus::FailSafeRequireApproval => "FAIL_SAFE_REQUIRE_APPROVAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ALLOW" => Some(DecisionStatus::Allow),
            "DENY" => Some(DecisionStatus::Deny),
            "REQUIRE_APPROVAL" => Some(DecisionStatus::RequireApproval),
            "ALLOW_WITH_CREDITS" => Some(DecisionStatus::AllowWithCredits),
            "FAIL_SAFE_ALLOW" => Some(DecisionStatus::FailSafeAllow),
            "FAIL_SAFE_DENY" => Some(DecisionStatus::FailSafeDeny),
            "FAIL_SAFE_REQUIRE_APPROVAL" => Some(DecisionStatus::FailSafeRequireApproval),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, DecisionStatus::RequireApproval)
    }

    pub fn is_fail_safe(self) -> bool {
        matches!(
            self,
            DecisionStatus::FailSafeAllow
                | DecisionStatus::FailSafeDeny
                | DecisionStatus::FailSafeRequireApproval
        )
    }
}

/// Normalized gate-adapter input, before tenant/source locking.
#[derive(Debug, Clone)]
pub struct DecisionInput {
    pub tenant_id: String,
    pub source: Source,
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub action: String,
    pub project_id: Option<String>,
    pub environment: Environment,
    pub resource_ref: String,
    pub estimated_monthly_delta_usd: Decimal,
    pub estimated_hourly_delta_usd: Decimal,
    /// Identity of the caller on whose behalf this gate request was made,
    /// recorded as `requester_id` on any approval request it spawns.
    pub requester_id: String,
}

/// The persisted, append-only-ledgered decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub tenant_id: String,
    pub source: Source,
    pub action: String,
    pub project_id: Option<String>,
    pub environment: Environment,
    pub resource_ref: String,
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub status: DecisionStatus,
    pub reason_code: String,
    pub estimated_monthly_delta_usd: Decimal,
    pub estimated_hourly_delta_usd: Decimal,
    pub computed_context: ComputedContext,
    pub entitlement_waterfall: WaterfallOutcome,
    pub credit_allocations: Vec<CreditAllocation>,
    pub policy_version: i64,
    pub policy_document_sha256: String,
    pub policy_document_schema_version: u32,
    pub mode_scope: ModeScope,
    pub approval_request_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(
            self.status,
            DecisionStatus::Allow | DecisionStatus::AllowWithCredits | DecisionStatus::FailSafeAllow
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_normalizes_case() {
        assert!(Environment::new("PROD").is_prod());
        assert!(Environment::new("Prod").is_prod());
        assert!(!Environment::new("production").is_prod());
        assert!(!Environment::new("staging").is_prod());
    }

    #[test]
    fn fail_safe_statuses_are_flagged() {
        assert!(DecisionStatus::FailSafeDeny.is_fail_safe());
        assert!(!DecisionStatus::Deny.is_fail_safe());
    }

    #[test]
    fn only_require_approval_is_non_terminal() {
        assert!(!DecisionStatus::RequireApproval.is_terminal());
        assert!(DecisionStatus::Allow.is_terminal());
        assert!(DecisionStatus::FailSafeDeny.is_terminal());
    }
}
