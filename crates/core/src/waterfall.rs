//! Entitlement Waterfall Evaluator.
//!
//! Five funding stages are tried in a fixed order. The first stage able to
//! authorize the full requested delta wins and the waterfall stops there;
//! if none can, the reported `reason_code` is the first stage (in
//! evaluation order) that failed, per the policy's own ordering.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::ledger::grants::{self, CreditAllocation, CreditGrantView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterfallStage {
    PlanCeiling,
    ProjectAllocation,
    ReservedCredits,
    EmergencyCredits,
    EnterpriseCeiling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: WaterfallStage,
    pub pass: bool,
    pub consumed_amount_usd: Decimal,
    pub remaining_amount_usd: Decimal,
    pub credit_allocations: Vec<CreditAllocation>,
    pub reason_code: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectBudgetView {
    pub configured: bool,
    pub used_usd: Decimal,
    pub cap_usd: Decimal,
}

pub struct WaterfallInput {
    pub requested_monthly_delta_usd: Decimal,
    pub active_plan_usage_usd: Decimal,
    pub plan_monthly_ceiling_usd: Decimal,
    pub project_budget: ProjectBudgetView,
    /// Sorted by the caller: `expires_at` ascending, then `created_at`
    /// ascending, then `id` ascending.
    pub reserved_grants: Vec<CreditGrantView>,
    pub emergency_grants: Vec<CreditGrantView>,
    pub active_enterprise_usage_usd: Decimal,
    pub enterprise_monthly_ceiling_usd: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallOutcome {
    pub stages: Vec<StageOutcome>,
    pub overall_pass: bool,
    pub reason_code: String,
    pub credit_allocations: Vec<CreditAllocation>,
}

fn check_nonnegative(value: Decimal, field: &str) -> Result<()> {
    if value.is_sign_negative() {
        return Err(CoreError::InvariantViolation(format!(
            "{field} must not be negative, got {value}"
        )));
    }
    Ok(())
}

pub fn evaluate(input: &WaterfallInput) -> Result<WaterfallOutcome> {
    check_nonnegative(input.requested_monthly_delta_usd, "requested_monthly_delta_usd")?;
    check_nonnegative(input.plan_monthly_ceiling_usd, "plan_monthly_ceiling_usd")?;
    check_nonnegative(input.enterprise_monthly_ceiling_usd, "enterprise_monthly_ceiling_usd")?;
    if input.project_budget.configured {
        check_nonnegative(input.project_budget.cap_usd, "project_budget.cap_usd")?;
    }

    let requested = input.requested_monthly_delta_usd;
    let mut stages = Vec::with_capacity(5);

    // Stage 1: plan ceiling.
    let plan_after = crate::money::normalize(input.active_plan_usage_usd + requested);
    let plan_pass = plan_after <= input.plan_monthly_ceiling_usd;
    stages.push(StageOutcome {
        stage: WaterfallStage::PlanCeiling,
        pass: plan_pass,
        consumed_amount_usd: if plan_pass { requested } else { Decimal::ZERO },
        remaining_amount_usd: crate::money::normalize(
            (input.plan_monthly_ceiling_usd - plan_after).max(Decimal::ZERO),
        ),
        credit_allocations: Vec::new(),
        reason_code: if plan_pass { "ok" } else { "over_plan_ceiling" }.to_string(),
    });
    if plan_pass {
        return Ok(finish(stages, true, "ok", Vec::new()));
    }

    // Stage 2: project allocation. Not configured short-circuits as pass,
    // but (unlike a genuine pass) does not resolve the pending deficit.
    let (project_pass, project_resolves) = if !input.project_budget.configured {
        (true, false)
    } else {
        let after = crate::money::normalize(input.project_budget.used_usd + requested);
        (after <= input.project_budget.cap_usd, true)
    };
    stages.push(StageOutcome {
        stage: WaterfallStage::ProjectAllocation,
        pass: project_pass,
        consumed_amount_usd: if project_pass && project_resolves { requested } else { Decimal::ZERO },
        remaining_amount_usd: if input.project_budget.configured {
            crate::money::normalize(
                (input.project_budget.cap_usd - input.project_budget.used_usd - requested).max(Decimal::ZERO),
            )
        } else {
            Decimal::ZERO
        },
        credit_allocations: Vec::new(),
        reason_code: if project_pass { "ok" } else { "over_project_allocation" }.to_string(),
    });
    if project_pass && project_resolves {
        return Ok(finish(stages, true, "ok", Vec::new()));
    }

    // Stage 3: reserved credits, consuming up to the full requested amount.
    let (reserved_allocations, unmet_after_reserved) = grants::greedy_draw(&input.reserved_grants, requested);
    let reserved_consumed = crate::money::normalize(requested - unmet_after_reserved);
    let reserved_pass = unmet_after_reserved.is_zero();
    stages.push(StageOutcome {
        stage: WaterfallStage::ReservedCredits,
        pass: reserved_pass,
        consumed_amount_usd: reserved_consumed,
        remaining_amount_usd: unmet_after_reserved,
        credit_allocations: reserved_allocations.clone(),
        reason_code: if reserved_pass { "ok" } else { "reserved_credits_exhausted" }.to_string(),
    });
    if reserved_pass {
        return Ok(finish(stages, true, "ok", reserved_allocations));
    }

    // Stage 4: emergency credits, covering whatever reserved credits left unmet.
    let (emergency_allocations, unmet_after_emergency) =
        grants::greedy_draw(&input.emergency_grants, unmet_after_reserved);
    let emergency_consumed = crate::money::normalize(unmet_after_reserved - unmet_after_emergency);
    let emergency_pass = unmet_after_emergency.is_zero();
    stages.push(StageOutcome {
        stage: WaterfallStage::EmergencyCredits,
        pass: emergency_pass,
        consumed_amount_usd: emergency_consumed,
        remaining_amount_usd: unmet_after_emergency,
        credit_allocations: emergency_allocations.clone(),
        reason_code: if emergency_pass { "ok" } else { "emergency_credits_exhausted" }.to_string(),
    });
    if emergency_pass {
        let mut combined = reserved_allocations;
        combined.extend(emergency_allocations);
        return Ok(finish(stages, true, "ok", combined));
    }

    // Stage 5: enterprise ceiling, the final backstop.
    let enterprise_after = crate::money::normalize(input.active_enterprise_usage_usd + requested);
    let enterprise_pass = enterprise_after <= input.enterprise_monthly_ceiling_usd;
    stages.push(StageOutcome {
        stage: WaterfallStage::EnterpriseCeiling,
        pass: enterprise_pass,
        consumed_amount_usd: if enterprise_pass { requested } else { Decimal::ZERO },
        remaining_amount_usd: crate::money::normalize(
            (input.enterprise_monthly_ceiling_usd - enterprise_after).max(Decimal::ZERO),
        ),
        credit_allocations: Vec::new(),
        reason_code: if enterprise_pass { "ok" } else { "over_enterprise_ceiling" }.to_string(),
    });
    if enterprise_pass {
        return Ok(finish(stages, true, "ok", Vec::new()));
    }

    let first_failure = stages
        .iter()
        .find(|s| !s.pass)
        .map(|s| s.reason_code.clone())
        .unwrap_or_else(|| "over_enterprise_ceiling".to_string());
    Ok(finish(stages, false, &first_failure, Vec::new()))
}

fn finish(
    stages: Vec<StageOutcome>,
    overall_pass: bool,
    reason_code: &str,
    credit_allocations: Vec<CreditAllocation>,
) -> WaterfallOutcome {
    WaterfallOutcome {
        stages,
        overall_pass,
        reason_code: reason_code.to_string(),
        credit_allocations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::grants::CreditPoolType;
    use chrono::Utc;
    use uuid::Uuid;

    fn base_input(requested: i64, plan_usage: i64, plan_ceiling: i64) -> WaterfallInput {
        WaterfallInput {
            requested_monthly_delta_usd: Decimal::from(requested),
            active_plan_usage_usd: Decimal::from(plan_usage),
            plan_monthly_ceiling_usd: Decimal::from(plan_ceiling),
            project_budget: ProjectBudgetView::default(),
            reserved_grants: Vec::new(),
            emergency_grants: Vec::new(),
            active_enterprise_usage_usd: Decimal::ZERO,
            enterprise_monthly_ceiling_usd: Decimal::ZERO,
        }
    }

    fn grant(remaining: i64, pool_type: CreditPoolType) -> CreditGrantView {
        CreditGrantView {
            id: Uuid::new_v4(),
            pool_type,
            remaining_amount_usd: Decimal::from(remaining),
            expires_at: Utc::now() + chrono::Duration::days(30),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn passes_cleanly_within_plan_ceiling() {
        let input = base_input(300, 1200, 5000);
        let outcome = evaluate(&input).unwrap();
        assert!(outcome.overall_pass);
        assert_eq!(outcome.reason_code, "ok");
        assert_eq!(outcome.stages.len(), 1);
        assert!(outcome.credit_allocations.is_empty());
    }

    #[test]
    fn denies_over_ceiling_with_no_credits_available() {
        let mut input = base_input(2000, 9500, 10000);
        input.enterprise_monthly_ceiling_usd = Decimal::ZERO;
        let outcome = evaluate(&input).unwrap();
        assert!(!outcome.overall_pass);
        assert_eq!(outcome.reason_code, "over_plan_ceiling");
    }

    #[test]
    fn falls_back_to_reserved_credits_when_over_ceiling() {
        let mut input = base_input(400, 9800, 10000);
        input.reserved_grants = vec![grant(500, CreditPoolType::Reserved)];
        let outcome = evaluate(&input).unwrap();
        assert!(outcome.overall_pass);
        assert_eq!(outcome.reason_code, "ok");
        let reserved_stage = outcome
            .stages
            .iter()
            .find(|s| s.stage == WaterfallStage::ReservedCredits)
            .unwrap();
        assert_eq!(reserved_stage.consumed_amount_usd, Decimal::from(400));
        assert_eq!(outcome.credit_allocations.len(), 1);
        assert_eq!(outcome.credit_allocations[0].amount_usd, Decimal::from(400));
    }

    #[test]
    fn spills_from_reserved_to_emergency() {
        let mut input = base_input(400, 9800, 10000);
        input.reserved_grants = vec![grant(150, CreditPoolType::Reserved)];
        input.emergency_grants = vec![grant(500, CreditPoolType::Emergency)];
        let outcome = evaluate(&input).unwrap();
        assert!(outcome.overall_pass);
        assert_eq!(outcome.credit_allocations.len(), 2);
        let total: Decimal = outcome.credit_allocations.iter().map(|a| a.amount_usd).sum();
        assert_eq!(total, Decimal::from(400));
    }

    #[test]
    fn enterprise_ceiling_is_final_backstop() {
        let mut input = base_input(400, 9800, 10000);
        input.active_enterprise_usage_usd = Decimal::from(20000);
        input.enterprise_monthly_ceiling_usd = Decimal::from(50000);
        let outcome = evaluate(&input).unwrap();
        assert!(outcome.overall_pass);
        assert_eq!(outcome.reason_code, "ok");
        assert!(outcome.credit_allocations.is_empty());
    }

    #[test]
    fn all_stages_exhausted_reports_first_failure() {
        let mut input = base_input(400, 9800, 10000);
        input.active_enterprise_usage_usd = Decimal::from(49900);
        input.enterprise_monthly_ceiling_usd = Decimal::from(50000);
        let outcome = evaluate(&input).unwrap();
        assert!(!outcome.overall_pass);
        assert_eq!(outcome.reason_code, "over_plan_ceiling");
        assert_eq!(outcome.stages.len(), 5);
    }

    #[test]
    fn negative_ceiling_fails_closed() {
        let mut input = base_input(100, 0, 0);
        input.plan_monthly_ceiling_usd = Decimal::from(-1);
        assert!(matches!(evaluate(&input), Err(CoreError::InvariantViolation(_))));
    }

    #[test]
    fn project_allocation_short_circuit_does_not_resolve_deficit() {
        let mut input = base_input(400, 9800, 10000);
        // Project budget not configured: short-circuits as pass but credits
        // are still needed to cover the plan-ceiling deficit.
        input.reserved_grants = vec![grant(1000, CreditPoolType::Reserved)];
        let outcome = evaluate(&input).unwrap();
        let project_stage = outcome
            .stages
            .iter()
            .find(|s| s.stage == WaterfallStage::ProjectAllocation)
            .unwrap();
        assert!(project_stage.pass);
        assert_eq!(project_stage.consumed_amount_usd, Decimal::ZERO);
        assert!(outcome
            .stages
            .iter()
            .any(|s| s.stage == WaterfallStage::ReservedCredits));
    }
}
