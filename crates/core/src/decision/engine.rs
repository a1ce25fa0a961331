//! The decision engine: `evaluate_gate`.
//!
//! Single entry point consulted by every gate adapter. Takes
//! the per-`(tenant, source)` serialization lock, resolves policy + context
//! + entitlement waterfall, decides ALLOW/DENY/REQUIRE_APPROVAL/
//! ALLOW_WITH_CREDITS (or a FAIL_SAFE_* equivalent on error), persists, and
//! reserves credits before releasing the lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::approval::workflow::ApprovalWorkflow;
use crate::context::{ComputedContextBuilder, CostHistoryReader};
use crate::decision::ledger_store::DecisionLedgerStore;
use crate::decision::model::{Decision, DecisionInput, DecisionStatus, Source};
use crate::error::CoreError;
use crate::error_budget::{classify_burn_rate, BudgetWindow, BurnAlert, ErrorBudgetTracker, ALL_BUDGET_WINDOWS};
use crate::failsafe::{FailSafeSelector, Mode};
use crate::ledger::grants::CreditGrantView;
use crate::ledger::reservation::ReservationLedger;
use crate::metrics::{LockEventOutcome, MetricsSink};
use crate::policy::{PolicyDocument, PolicyStore, RoutingRule};
use crate::tenant::TierResolver;
use crate::waterfall::{self, ProjectBudgetView, WaterfallInput, WaterfallOutcome};

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Abstraction over tenant+source serialization. A real implementation
/// claims a Postgres advisory lock (or a row lock on a per-tenant-source
/// ticket row); `release` is best-effort and is also covered by the
/// underlying transaction ending.
#[async_trait]
pub trait GateLock: Send + Sync {
    async fn try_acquire(&self, tenant_id: &str, source: Source) -> crate::error::Result<bool>;
    async fn release(&self, tenant_id: &str, source: Source) -> crate::error::Result<()>;
}

/// Read-only view of budget/entitlement state the engine needs per decision.
/// Backed by the ledger + cost-history dependencies in a real deployment;
/// kept as a trait so the engine doesn't hardcode SQL.
#[async_trait]
pub trait EntitlementState: Send + Sync {
    async fn active_plan_usage_usd(&self, tenant_id: &str, month_start: chrono::NaiveDate) -> anyhow::Result<Decimal>;
    async fn project_budget(&self, tenant_id: &str, project_id: Option<&str>) -> anyhow::Result<ProjectBudgetView>;
    async fn reserved_grants(&self, tenant_id: &str) -> anyhow::Result<Vec<CreditGrantView>>;
    async fn emergency_grants(&self, tenant_id: &str) -> anyhow::Result<Vec<CreditGrantView>>;
    async fn active_enterprise_usage_usd(&self, tenant_id: &str, month_start: chrono::NaiveDate) -> anyhow::Result<Decimal>;
}

/// Row-backed mutex: a present `(tenant_id, source)` row in `gate_locks` is
/// the lock. Acquiring is `insert ... on conflict do nothing`, releasing is
/// a delete — a pooled `&self` connection never needs to hold a session
/// across the whole `try_acquire`/`release` pair.
pub struct PostgresGateLock {
    pool: PgPool,
}

impl PostgresGateLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GateLock for PostgresGateLock {
    async fn try_acquire(&self, tenant_id: &str, source: Source) -> crate::error::Result<bool> {
        let result = sqlx::query(
            "insert into gate_locks (tenant_id, source) values ($1, $2) on conflict do nothing",
        )
        .bind(tenant_id)
        .bind(source.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, tenant_id: &str, source: Source) -> crate::error::Result<()> {
        sqlx::query("delete from gate_locks where tenant_id = $1 and source = $2")
            .bind(tenant_id)
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Aggregates entitlement state directly from the scalar tables: `decisions`
/// for month-to-date usage, `project_allocations` for project budgets, and
/// `credit_grants` for the reserved/emergency pools.
pub struct PostgresEntitlementState {
    pool: PgPool,
}

impl PostgresEntitlementState {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn grants_for_pool(&self, tenant_id: &str, pool_type: &str) -> anyhow::Result<Vec<CreditGrantView>> {
        let rows = sqlx::query(
            r#"
            select id, remaining_amount_usd, expires_at, created_at
            from credit_grants
            where tenant_id = $1 and pool_type = $2 and remaining_amount_usd > 0 and expires_at > now()
            order by expires_at asc, created_at asc, id asc
            "#,
        )
        .bind(tenant_id)
        .bind(pool_type)
        .fetch_all(&self.pool)
        .await?;

        let view_pool_type = if pool_type == "reserved" {
            crate::ledger::grants::CreditPoolType::Reserved
        } else {
            crate::ledger::grants::CreditPoolType::Emergency
        };
        Ok(rows
            .into_iter()
            .map(|row| CreditGrantView {
                id: row.get("id"),
                pool_type: view_pool_type,
                remaining_amount_usd: row.get("remaining_amount_usd"),
                expires_at: row.get("expires_at"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

const ALLOW_STATUSES: &[&str] = &["ALLOW", "ALLOW_WITH_CREDITS", "FAIL_SAFE_ALLOW"];

#[async_trait]
impl EntitlementState for PostgresEntitlementState {
    async fn active_plan_usage_usd(&self, tenant_id: &str, month_start: chrono::NaiveDate) -> anyhow::Result<Decimal> {
        let month_start: DateTime<Utc> = DateTime::from_naive_utc_and_offset(
            month_start.and_hms_opt(0, 0, 0).expect("midnight always valid"),
            Utc,
        );
        let row = sqlx::query(
            r#"
            select coalesce(sum(estimated_monthly_delta_usd), 0) as total
            from decisions
            where tenant_id = $1 and status = any($2) and created_at >= $3
            "#,
        )
        .bind(tenant_id)
        .bind(ALLOW_STATUSES)
        .bind(month_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("total"))
    }

    async fn project_budget(&self, tenant_id: &str, project_id: Option<&str>) -> anyhow::Result<ProjectBudgetView> {
        let Some(project_id) = project_id else {
            return Ok(ProjectBudgetView::default());
        };
        let row = sqlx::query(
            "select monthly_cap_usd, used_usd from project_allocations where tenant_id = $1 and project_id = $2",
        )
        .bind(tenant_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => ProjectBudgetView {
                configured: true,
                used_usd: row.get("used_usd"),
                cap_usd: row.get("monthly_cap_usd"),
            },
            None => ProjectBudgetView::default(),
        })
    }

    async fn reserved_grants(&self, tenant_id: &str) -> anyhow::Result<Vec<CreditGrantView>> {
        self.grants_for_pool(tenant_id, "reserved").await
    }

    async fn emergency_grants(&self, tenant_id: &str) -> anyhow::Result<Vec<CreditGrantView>> {
        self.grants_for_pool(tenant_id, "emergency").await
    }

    async fn active_enterprise_usage_usd(&self, tenant_id: &str, month_start: chrono::NaiveDate) -> anyhow::Result<Decimal> {
        let month_start: DateTime<Utc> = DateTime::from_naive_utc_and_offset(
            month_start.and_hms_opt(0, 0, 0).expect("midnight always valid"),
            Utc,
        );
        let row = sqlx::query(
            r#"
            select coalesce(sum(estimated_monthly_delta_usd), 0) as total
            from decisions
            where tenant_id = $1 and status = any($2) and created_at >= $3
            "#,
        )
        .bind(tenant_id)
        .bind(ALLOW_STATUSES)
        .bind(month_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("total"))
    }
}

pub struct GateDependencies {
    pub policy_store: Arc<dyn PolicyStore>,
    pub tier_resolver: Arc<TierResolver>,
    pub cost_reader: Arc<dyn CostHistoryReader>,
    pub entitlement_state: Arc<dyn EntitlementState>,
    pub ledger_store: Arc<dyn DecisionLedgerStore>,
    pub reservation_ledger: Arc<ReservationLedger>,
    pub approval_workflow: Arc<ApprovalWorkflow>,
    pub lock: Arc<dyn GateLock>,
    pub fail_safe: FailSafeSelector,
    pub metrics: Arc<dyn MetricsSink>,
    pub error_budget: Arc<ErrorBudgetTracker>,
    pub lock_wait: Duration,
    pub gate_timeout: Duration,
    /// Minimum risk score that forces REQUIRE_APPROVAL even when every
    /// waterfall stage passed cleanly.
    pub risk_require_approval_threshold: f64,
    /// `1 - target_availability` for the gate's SLO; denominator of
    /// `error_budget_burn_ratio_*`.
    pub slo_error_budget: f64,
}

pub struct DecisionEngine {
    deps: GateDependencies,
}

impl DecisionEngine {
    pub fn new(deps: GateDependencies) -> Self {
        Self { deps }
    }

    pub async fn evaluate_gate(&self, input: DecisionInput) -> Result<Decision, EvaluateError> {
        let outcome = match tokio::time::timeout(self.deps.gate_timeout, self.evaluate_inner(&input)).await {
            Ok(Ok(decision)) => Ok(decision),
            // Only lock/dependency-class failures become a FAIL_SAFE_*
            // decision (and a ledger row). Idempotency and token errors are
            // typed 4xx — they never surface as fail-safe and never
            // mint a ledger row of their own.
            Ok(Err(err)) if err.is_fail_safe_trigger() => self.fail_safe_decision(&input, &err).await,
            Ok(Err(err)) => Err(EvaluateError::Core(err)),
            Err(_elapsed) => {
                self.fail_safe_decision(&input, &CoreError::DependencyUnavailable("timeout".into())).await
            }
        };
        if let Ok(decision) = &outcome {
            self.record_error_budget_outcome(decision.status);
        }
        outcome
    }

    /// Records the decision against the sliding error-budget windows (a
    /// FAIL_SAFE_* status burns budget, anything else doesn't), pushes the
    /// refreshed `error_budget_burn_ratio_{5m,30m,1h,6h}` gauges, and logs
    /// the fast/slow multi-window burn-rate alert if one now fires.
    fn record_error_budget_outcome(&self, status: DecisionStatus) {
        let is_error = status.is_fail_safe();
        self.deps.error_budget.record(is_error);

        let mut ratios = [0.0_f64; 4];
        for (i, window) in ALL_BUDGET_WINDOWS.iter().enumerate() {
            let ratio = self.deps.error_budget.burn_ratio(*window, self.deps.slo_error_budget);
            ratios[i] = ratio;
            self.deps.metrics.set_error_budget_burn_ratio(*window, ratio);
        }
        let [ratio_5m, ratio_30m, ratio_1h, ratio_6h] = ratios;

        match classify_burn_rate(ratio_1h, ratio_5m, ratio_6h, ratio_30m) {
            BurnAlert::Critical => tracing::error!(
                ratio_1h, ratio_5m, "fast error-budget burn: 1h and 5m windows both over 14.4x the SLO budget"
            ),
            BurnAlert::Warning => tracing::warn!(
                ratio_6h, ratio_30m, "slow error-budget burn: 6h and 30m windows both over 6x the SLO budget"
            ),
            BurnAlert::None => {}
        }
    }

    async fn evaluate_inner(&self, input: &DecisionInput) -> crate::error::Result<Decision> {
        if let Some(existing) = self
            .deps
            .ledger_store
            .find_by_idempotency_key(&input.tenant_id, input.source.as_str(), &input.idempotency_key)
            .await?
        {
            if existing.request_fingerprint != input.request_fingerprint {
                return Err(CoreError::IdempotencyConflict);
            }
            return Ok(existing);
        }

        self.acquire_lock(&input.tenant_id, input.source).await?;
        let result = self.evaluate_locked(input).await;
        let _ = self.deps.lock.release(&input.tenant_id, input.source).await;
        result
    }

    async fn acquire_lock(&self, tenant_id: &str, source: Source) -> crate::error::Result<()> {
        let deadline = Instant::now() + self.deps.lock_wait;
        let mut contended = false;
        loop {
            match self.deps.lock.try_acquire(tenant_id, source).await {
                Ok(true) => {
                    self.deps.metrics.record_lock_event(LockEventOutcome::Acquired);
                    return Ok(());
                }
                Ok(false) => {
                    if !contended {
                        self.deps.metrics.record_lock_event(LockEventOutcome::Contended);
                        contended = true;
                    }
                }
                Err(err) => {
                    self.deps.metrics.record_lock_event(LockEventOutcome::NotAcquired);
                    return Err(err);
                }
            }
            if Instant::now() >= deadline {
                self.deps.metrics.record_lock_event(LockEventOutcome::Timeout);
                return Err(CoreError::LockTimeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn evaluate_locked(&self, input: &DecisionInput) -> crate::error::Result<Decision> {
        if let Some(existing) = self
            .deps
            .ledger_store
            .find_by_idempotency_key(&input.tenant_id, input.source.as_str(), &input.idempotency_key)
            .await?
        {
            if existing.request_fingerprint != input.request_fingerprint {
                return Err(CoreError::IdempotencyConflict);
            }
            return Ok(existing);
        }

        let policy = self.deps.policy_store.get_active(&input.tenant_id).await?;
        let mode_scope = self.deps.fail_safe.resolve(input.source, &input.environment);
        let tier = self.deps.tier_resolver.get_tenant_tier(&input.tenant_id).await;
        tracing::debug!(
            tenant_id = %input.tenant_id,
            tier = tier.as_str(),
            source = input.source.as_str(),
            "evaluating gate"
        );

        let month_start = Utc::now().date_naive().with_day(1).expect("day 1 always valid");
        let context = ComputedContextBuilder::new(self.deps.cost_reader.as_ref())
            .build(
                &input.tenant_id,
                Utc::now(),
                policy.plan_monthly_ceiling_usd,
                input.estimated_monthly_delta_usd,
            )
            .await;

        let plan_usage = self
            .deps
            .entitlement_state
            .active_plan_usage_usd(&input.tenant_id, month_start)
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;
        let project_budget = self
            .deps
            .entitlement_state
            .project_budget(&input.tenant_id, input.project_id.as_deref())
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;
        let mut reserved_grants = self
            .deps
            .entitlement_state
            .reserved_grants(&input.tenant_id)
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;
        let mut emergency_grants = self
            .deps
            .entitlement_state
            .emergency_grants(&input.tenant_id)
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;
        let enterprise_usage = self
            .deps
            .entitlement_state
            .active_enterprise_usage_usd(&input.tenant_id, month_start)
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;

        sort_grants_oldest_expiry_first(&mut reserved_grants);
        sort_grants_oldest_expiry_first(&mut emergency_grants);

        let waterfall_input = WaterfallInput {
            requested_monthly_delta_usd: input.estimated_monthly_delta_usd,
            active_plan_usage_usd: plan_usage,
            plan_monthly_ceiling_usd: policy.plan_monthly_ceiling_usd,
            project_budget,
            reserved_grants,
            emergency_grants,
            active_enterprise_usage_usd: enterprise_usage,
            enterprise_monthly_ceiling_usd: policy.enterprise_monthly_ceiling_usd,
        };
        let waterfall_outcome = waterfall::evaluate(&waterfall_input)?;

        let routing_rule = match_routing_rule(&policy, input);
        let risk_triggered = context.risk_score >= self.deps.risk_require_approval_threshold;
        let soft_mode_triggered = !waterfall_outcome.overall_pass && mode_scope.mode == Mode::Soft;
        let needs_approval = routing_rule.is_some() || risk_triggered || soft_mode_triggered;

        let status = decide_status(&waterfall_outcome, mode_scope.mode, needs_approval);
        let reason_code = if status == DecisionStatus::Deny && !waterfall_outcome.overall_pass {
            waterfall_outcome.reason_code.to_string()
        } else if needs_approval && routing_rule.is_some() {
            "approval_routing_rule_matched".to_string()
        } else {
            waterfall_outcome.reason_code.to_string()
        };

        let mut decision = Decision {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id.clone(),
            source: input.source,
            action: input.action.clone(),
            project_id: input.project_id.clone(),
            environment: input.environment.clone(),
            resource_ref: input.resource_ref.clone(),
            idempotency_key: input.idempotency_key.clone(),
            request_fingerprint: input.request_fingerprint.clone(),
            status,
            reason_code,
            estimated_monthly_delta_usd: input.estimated_monthly_delta_usd,
            estimated_hourly_delta_usd: input.estimated_hourly_delta_usd,
            computed_context: context,
            credit_allocations: waterfall_outcome.credit_allocations.clone(),
            entitlement_waterfall: waterfall_outcome,
            policy_version: policy.policy_version,
            policy_document_sha256: policy.sha256_hash.clone(),
            policy_document_schema_version: policy.schema_version,
            mode_scope,
            approval_request_id: None,
            created_at: Utc::now(),
        };

        self.deps.ledger_store.append(&decision).await?;

        if decision.status == DecisionStatus::RequireApproval {
            let effective_rule = routing_rule
                .cloned()
                .unwrap_or_else(|| synthetic_approval_rule(&input.environment, risk_triggered, soft_mode_triggered));
            let approval = self
                .deps
                .approval_workflow
                .create_for_decision(&decision, &input.requester_id, &effective_rule)
                .await?;
            decision.approval_request_id = Some(approval.id);
            self.deps.ledger_store.append(&decision).await?;
        }

        if matches!(
            decision.status,
            DecisionStatus::AllowWithCredits | DecisionStatus::RequireApproval
        ) && !decision.credit_allocations.is_empty()
        {
            self.deps
                .reservation_ledger
                .reserve(decision.id, &decision.credit_allocations)
                .await?;
        }

        Ok(decision)
    }

    async fn fail_safe_decision(
        &self,
        input: &DecisionInput,
        err: &CoreError,
    ) -> Result<Decision, EvaluateError> {
        let mode_scope = self.deps.fail_safe.resolve(input.source, &input.environment);
        let status = mode_scope.mode.fail_safe_status();
        let reason_code = err.code().to_string();

        let policy_fallback = self
            .deps
            .policy_store
            .get_active(&input.tenant_id)
            .await
            .unwrap_or_else(|_| fallback_policy_document());

        let decision = Decision {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id.clone(),
            source: input.source,
            action: input.action.clone(),
            project_id: input.project_id.clone(),
            environment: input.environment.clone(),
            resource_ref: input.resource_ref.clone(),
            idempotency_key: input.idempotency_key.clone(),
            request_fingerprint: input.request_fingerprint.clone(),
            status,
            reason_code,
            estimated_monthly_delta_usd: input.estimated_monthly_delta_usd,
            estimated_hourly_delta_usd: input.estimated_hourly_delta_usd,
            computed_context: crate::context::ComputedContext::unavailable(),
            entitlement_waterfall: WaterfallOutcome {
                stages: Vec::new(),
                overall_pass: status == DecisionStatus::FailSafeAllow,
                reason_code: "fail_safe".to_string(),
                credit_allocations: Vec::new(),
            },
            credit_allocations: Vec::new(),
            policy_version: policy_fallback.policy_version,
            policy_document_sha256: policy_fallback.sha256_hash.clone(),
            policy_document_schema_version: policy_fallback.schema_version,
            mode_scope,
            approval_request_id: None,
            created_at: Utc::now(),
        };

        let entry = self
            .deps
            .ledger_store
            .append(&decision)
            .await
            .map_err(EvaluateError::Core)?;
        Ok(entry.decision)
    }
}

fn sort_grants_oldest_expiry_first(grants: &mut [CreditGrantView]) {
    grants.sort_by(|a, b| {
        a.expires_at
            .cmp(&b.expires_at)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

fn match_routing_rule<'a>(policy: &'a PolicyDocument, input: &DecisionInput) -> Option<&'a crate::policy::RoutingRule> {
    policy.approval_routing_rules.iter().find(|rule| {
        let env_matches = rule.env.eq_ignore_ascii_case(input.environment.as_str());
        let action_matches = input.action.starts_with(&rule.action_prefix);
        let threshold_matches = rule
            .threshold()
            .map(|t| input.estimated_monthly_delta_usd >= t)
            .unwrap_or(false);
        env_matches && action_matches && threshold_matches
    })
}

/// Built when a decision needs approval but no policy routing rule matched
/// it — e.g. the risk score alone crossed the threshold, or a soft-mode
/// waterfall denial was downgraded to REQUIRE_APPROVAL. Quorum of one, no
/// role restriction, so any reviewer can clear it.
fn synthetic_approval_rule(environment: &crate::decision::model::Environment, risk_triggered: bool, soft_mode_triggered: bool) -> RoutingRule {
    let id = if risk_triggered {
        "risk_score_threshold"
    } else if soft_mode_triggered {
        "soft_mode_waterfall_denial"
    } else {
        "unspecified"
    };
    RoutingRule {
        id: id.to_string(),
        env: environment.as_str().to_string(),
        action_prefix: String::new(),
        monthly_delta_threshold: "0.000000".to_string(),
        risk_level: "auto".to_string(),
        allowed_reviewer_roles: Vec::new(),
        quorum: 1,
    }
}

fn decide_status(waterfall: &WaterfallOutcome, mode: Mode, needs_approval: bool) -> DecisionStatus {
    // SHADOW always allows, regardless of waterfall outcome, routing-rule
    // matches, or risk score — it only ever records what would have
    // happened (the reason code), never blocks or requires approval.
    if mode == Mode::Shadow {
        return DecisionStatus::Allow;
    }
    if !waterfall.overall_pass {
        return match mode {
            Mode::Hard => DecisionStatus::Deny,
            Mode::Soft => DecisionStatus::RequireApproval,
            Mode::Shadow => unreachable!("handled above"),
        };
    }
    if needs_approval {
        return DecisionStatus::RequireApproval;
    }
    if waterfall.credit_allocations.iter().any(|a| !a.amount_usd.is_zero()) {
        DecisionStatus::AllowWithCredits
    } else {
        DecisionStatus::Allow
    }
}

fn fallback_policy_document() -> PolicyDocument {
    use crate::policy::RequesterReviewerSeparation;
    PolicyDocument {
        schema_version: 0,
        policy_version: 0,
        canonical_payload: Vec::new(),
        sha256_hash: String::new(),
        terraform_mode_prod: Mode::Hard,
        terraform_mode_nonprod: Mode::Hard,
        k8s_mode_prod: Mode::Hard,
        k8s_mode_nonprod: Mode::Hard,
        plan_monthly_ceiling_usd: Decimal::ZERO,
        enterprise_monthly_ceiling_usd: Decimal::ZERO,
        approval_routing_rules: Vec::new(),
        requester_reviewer_separation: RequesterReviewerSeparation { prod: true, nonprod: true },
        action_max_attempts: 0,
        action_retry_backoff_seconds: 0,
        action_lease_ttl_seconds: 0,
    }
}
