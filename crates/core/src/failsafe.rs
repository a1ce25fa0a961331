//! Fail-safe mode selector.
//!
//! Resolves `(source, environment)` to one of SHADOW/SOFT/HARD and maps
//! evaluation failures (timeouts, lock contention, dependency outages) to the
//! matching `FAIL_SAFE_*` decision status.

use serde::{Deserialize, Serialize};

use crate::decision::model::{DecisionStatus, Environment, Source};

/// Fail-safe mode for a given (source, environment) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Always allows; records what would have happened.
    Shadow,
    /// Converts ceiling-triggered denials into REQUIRE_APPROVAL.
    Soft,
    /// Denies outright on a limiting stage.
    Hard,
}

impl Mode {
    /// The FAIL_SAFE_* status this mode produces on timeout/internal error.
    pub fn fail_safe_status(self) -> DecisionStatus {
        match self {
            Mode::Shadow => DecisionStatus::FailSafeAllow,
            Mode::Soft => DecisionStatus::FailSafeRequireApproval,
            Mode::Hard => DecisionStatus::FailSafeDeny,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Shadow => "SHADOW",
            Mode::Soft => "SOFT",
            Mode::Hard => "HARD",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_uppercase().as_str() {
            "SHADOW" => Some(Mode::Shadow),
            "SOFT" => Some(Mode::Soft),
            "HARD" => Some(Mode::Hard),
            _ => None,
        }
    }
}

/// The resolved mode plus the config field it came from, so decisions can
/// record `mode_scope` (e.g. `"terraform_mode_prod"`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModeScope {
    pub mode: Mode,
    pub scope: &'static str,
}

/// Matrix of `(source, normalized_environment) -> Mode`.
pub struct FailSafeSelector {
    terraform_mode_prod: Mode,
    terraform_mode_nonprod: Mode,
    k8s_admission_mode_prod: Mode,
    k8s_admission_mode_nonprod: Mode,
    cloud_event_mode: Mode,
    generic_mode: Mode,
}

impl FailSafeSelector {
    pub fn new(
        terraform_mode_prod: Mode,
        terraform_mode_nonprod: Mode,
        k8s_admission_mode_prod: Mode,
        k8s_admission_mode_nonprod: Mode,
        cloud_event_mode: Mode,
        generic_mode: Mode,
    ) -> Self {
        Self {
            terraform_mode_prod,
            terraform_mode_nonprod,
            k8s_admission_mode_prod,
            k8s_admission_mode_nonprod,
            cloud_event_mode,
            generic_mode,
        }
    }

    pub fn from_config(cfg: &crate::config::EnforcementConfig) -> Self {
        Self::new(
            cfg.terraform_mode_prod,
            cfg.terraform_mode_nonprod,
            cfg.k8s_admission_mode_prod,
            cfg.k8s_admission_mode_nonprod,
            cfg.cloud_event_mode,
            cfg.generic_mode,
        )
    }

    /// Resolves a mode scope for the given source and environment.
    ///
    /// `environment` is normalized: anything that isn't exactly `"prod"`
    /// (case-insensitive) is treated as nonprod.
    pub fn resolve(&self, source: Source, environment: &Environment) -> ModeScope {
        let is_prod = environment.is_prod();
        match (source, is_prod) {
            (Source::Terraform, true) => ModeScope {
                mode: self.terraform_mode_prod,
                scope: "terraform_mode_prod",
            },
            (Source::Terraform, false) => ModeScope {
                mode: self.terraform_mode_nonprod,
                scope: "terraform_mode_nonprod",
            },
            (Source::K8sAdmission, true) => ModeScope {
                mode: self.k8s_admission_mode_prod,
                scope: "k8s_admission_mode_prod",
            },
            (Source::K8sAdmission, false) => ModeScope {
                mode: self.k8s_admission_mode_nonprod,
                scope: "k8s_admission_mode_nonprod",
            },
            (Source::CloudEvent, _) => ModeScope {
                mode: self.cloud_event_mode,
                scope: "cloud_event_mode",
            },
            (Source::Generic, _) => ModeScope {
                mode: self.generic_mode,
                scope: "generic_mode",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> FailSafeSelector {
        FailSafeSelector::new(
            Mode::Hard,
            Mode::Soft,
            Mode::Hard,
            Mode::Soft,
            Mode::Soft,
            Mode::Shadow,
        )
    }

    #[test]
    fn resolves_terraform_prod_to_hard() {
        let scope = selector().resolve(Source::Terraform, &Environment::new("prod"));
        assert_eq!(scope.mode, Mode::Hard);
        assert_eq!(scope.scope, "terraform_mode_prod");
    }

    #[test]
    fn resolves_unknown_environment_to_nonprod() {
        let scope = selector().resolve(Source::K8sAdmission, &Environment::new("staging"));
        assert_eq!(scope.mode, Mode::Soft);
        assert_eq!(scope.scope, "k8s_admission_mode_nonprod");
    }

    #[test]
    fn prod_is_case_insensitive() {
        let scope = selector().resolve(Source::Terraform, &Environment::new("PROD"));
        assert_eq!(scope.mode, Mode::Hard);
    }

    #[test]
    fn mode_fail_safe_status_mapping() {
        assert_eq!(Mode::Hard.fail_safe_status(), DecisionStatus::FailSafeDeny);
        assert_eq!(
            Mode::Soft.fail_safe_status(),
            DecisionStatus::FailSafeRequireApproval
        );
        assert_eq!(
            Mode::Shadow.fail_safe_status(),
            DecisionStatus::FailSafeAllow
        );
    }
}
