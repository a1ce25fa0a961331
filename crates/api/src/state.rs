//! Wires every Postgres-backed adapter and core service into the shared
//! [`AppState`] handed to axum handlers: one function builds the whole
//! dependency graph from `EnforcementConfig`, and handlers only ever see
//! `Arc`s.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use enforcement_core::approval::token::TokenSigner;
use enforcement_core::approval::workflow::{ApprovalWorkflow, PostgresApprovalStore};
use enforcement_core::config::EnforcementConfig;
use enforcement_core::db::Database;
use enforcement_core::decision::engine::{
    DecisionEngine, GateDependencies, PostgresEntitlementState, PostgresGateLock,
};
use enforcement_core::decision::ledger_store::PostgresDecisionLedgerStore;
use enforcement_core::error_budget::ErrorBudgetTracker;
use enforcement_core::failsafe::FailSafeSelector;
use enforcement_core::ledger::reservation::{PostgresReservationStore, ReservationLedger};
use enforcement_core::metrics::MetricsSink;
use enforcement_core::policy::store::PostgresPolicyStore;
use enforcement_core::reconcile::{PostgresReconcileRecordStore, ReconciliationWorker};
use enforcement_core::tenant::TierResolver;
use enforcement_export::ExportSigner;
use sqlx::PgPool;

use crate::adapters::{PostgresCostHistoryReader, PostgresExportDataSource, PostgresTenantDirectory};
use crate::metrics::PrometheusMetricsSink;

/// Approval requests expire 24 hours after creation unless a routing rule
/// names a shorter TTL explicitly. The routing-rule-level override is
/// the approval workflow's responsibility; this is only the workflow-wide default.
const DEFAULT_APPROVAL_TTL_HOURS: i64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DecisionEngine>,
    pub policy_store: Arc<PostgresPolicyStore>,
    pub ledger_store: Arc<PostgresDecisionLedgerStore>,
    pub approval_workflow: Arc<ApprovalWorkflow>,
    pub reservation_ledger: Arc<ReservationLedger>,
    pub reconciliation_worker: Arc<ReconciliationWorker>,
    pub tier_resolver: Arc<TierResolver>,
    pub metrics: Arc<PrometheusMetricsSink>,
    pub export_source: Arc<PostgresExportDataSource>,
    pub export_signer: Arc<ExportSigner>,
    pub pool: PgPool,
    pub config: Arc<EnforcementConfig>,
}

impl AppState {
    pub async fn build(config: EnforcementConfig) -> anyhow::Result<Self> {
        let database = Database::connect(&config).await?;
        database.migrate().await?;
        let pool = database.pool().clone();

        let metrics = Arc::new(PrometheusMetricsSink::new()?);

        let policy_store = Arc::new(PostgresPolicyStore::new(pool.clone()));
        let tier_resolver = Arc::new(TierResolver::new(Box::new(PostgresTenantDirectory::new(pool.clone()))));
        let cost_reader = Arc::new(PostgresCostHistoryReader::new(pool.clone()));
        let entitlement_state = Arc::new(PostgresEntitlementState::new(pool.clone()));
        let ledger_store = Arc::new(PostgresDecisionLedgerStore::new(pool.clone()));
        let reservation_store = Arc::new(PostgresReservationStore::new(pool.clone()));
        let reservation_ledger = Arc::new(ReservationLedger::new(reservation_store));
        let gate_lock = Arc::new(PostgresGateLock::new(pool.clone()));

        let approval_store = Arc::new(PostgresApprovalStore::new(pool.clone()));
        let token_signer = TokenSigner::new(
            "enforcement-v1",
            config.enforcement_approval_token_secret.clone(),
            config.token_fallback_secrets(),
        );
        let approval_workflow = Arc::new(ApprovalWorkflow::new(
            approval_store,
            token_signer,
            ChronoDuration::hours(DEFAULT_APPROVAL_TTL_HOURS),
        ));

        let fail_safe = FailSafeSelector::from_config(&config);

        let deps = GateDependencies {
            policy_store: policy_store.clone(),
            tier_resolver: tier_resolver.clone(),
            cost_reader,
            entitlement_state,
            ledger_store: ledger_store.clone(),
            reservation_ledger: reservation_ledger.clone(),
            approval_workflow: approval_workflow.clone(),
            lock: gate_lock,
            fail_safe,
            metrics: metrics.clone() as Arc<dyn MetricsSink>,
            error_budget: Arc::new(ErrorBudgetTracker::new()),
            lock_wait: config.lock_wait(),
            gate_timeout: config.gate_timeout(),
            risk_require_approval_threshold: config.enforcement_risk_require_approval_threshold,
            slo_error_budget: config.enforcement_slo_error_budget,
        };
        let engine = Arc::new(DecisionEngine::new(deps));

        let reconcile_record_store = Arc::new(PostgresReconcileRecordStore::new(pool.clone()));
        let reconciliation_worker = Arc::new(ReconciliationWorker::new(
            reservation_ledger.clone(),
            ledger_store.clone(),
            reconcile_record_store,
            metrics.clone() as Arc<dyn MetricsSink>,
        ));

        let export_source = Arc::new(PostgresExportDataSource::new(pool.clone()));
        let export_signer = Arc::new(ExportSigner {
            secret: config.enforcement_export_signing_secret.clone(),
            kid: config.enforcement_export_signing_kid.clone(),
        });

        Ok(Self {
            engine,
            policy_store,
            ledger_store,
            approval_workflow,
            reservation_ledger,
            reconciliation_worker,
            tier_resolver,
            metrics,
            export_source,
            export_signer,
            pool,
            config: Arc::new(config),
        })
    }

    pub fn gate_timeout(&self) -> Duration {
        self.config.gate_timeout()
    }
}
