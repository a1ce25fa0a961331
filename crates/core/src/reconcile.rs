//! The reconciliation worker.
//!
//! Two entry points: the periodic overdue sweep (`run_overdue_sweep`) and
//! the manual reconcile endpoint's idempotent-replay logic
//! (`reconcile_manual`). Both ultimately call into the reservation-ledger
//! [`ReservationLedger`](crate::ledger::reservation::ReservationLedger) and
//! append one ledger row per processed reservation.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::decision::ledger_store::DecisionLedgerStore;
use crate::error::{CoreError, Result};
use crate::ledger::reservation::{ReconcileOutcome, ReservationLedger};
use crate::metrics::{MetricsSink, ReconcileTrigger};

/// Tracks the last manual-reconcile payload applied per decision, so a
/// retried request with the same `Idempotency-Key` and body replays the
/// prior result instead of re-applying the settle/refund.
#[async_trait]
pub trait ReconcileRecordStore: Send + Sync {
    async fn get(&self, decision_id: Uuid) -> Result<Option<ReconcileRecord>>;
    async fn put(&self, decision_id: Uuid, record: ReconcileRecord) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileRecord {
    pub idempotency_key: String,
    pub actual_usd: Decimal,
    pub outcome: ManualReconcileOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualReconcileOutcome {
    Settled,
    Refunded,
}

impl ManualReconcileOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ManualReconcileOutcome::Settled => "SETTLED",
            ManualReconcileOutcome::Refunded => "REFUNDED",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SETTLED" => Some(ManualReconcileOutcome::Settled),
            "REFUNDED" => Some(ManualReconcileOutcome::Refunded),
            _ => None,
        }
    }
}

pub struct PostgresReconcileRecordStore {
    pool: PgPool,
}

impl PostgresReconcileRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconcileRecordStore for PostgresReconcileRecordStore {
    async fn get(&self, decision_id: Uuid) -> Result<Option<ReconcileRecord>> {
        let row = sqlx::query(
            "select idempotency_key, actual_usd, outcome from manual_reconcile_records where decision_id = $1",
        )
        .bind(decision_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let outcome: String = row.get("outcome");
                Ok(Some(ReconcileRecord {
                    idempotency_key: row.get("idempotency_key"),
                    actual_usd: row.get("actual_usd"),
                    outcome: ManualReconcileOutcome::parse(&outcome)
                        .ok_or_else(|| CoreError::InvariantViolation(format!("unknown reconcile outcome: {outcome}")))?,
                }))
            }
        }
    }

    async fn put(&self, decision_id: Uuid, record: ReconcileRecord) -> Result<()> {
        sqlx::query(
            r#"
            insert into manual_reconcile_records (decision_id, idempotency_key, actual_usd, outcome)
            values ($1, $2, $3, $4)
            on conflict (decision_id) do update set
                idempotency_key = excluded.idempotency_key,
                actual_usd = excluded.actual_usd,
                outcome = excluded.outcome
            "#,
        )
        .bind(decision_id)
        .bind(&record.idempotency_key)
        .bind(record.actual_usd)
        .bind(record.outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct ReconciliationWorker {
    reservation_ledger: Arc<ReservationLedger>,
    ledger_store: Arc<dyn DecisionLedgerStore>,
    record_store: Arc<dyn ReconcileRecordStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReconciliationWorker {
    pub fn new(
        reservation_ledger: Arc<ReservationLedger>,
        ledger_store: Arc<dyn DecisionLedgerStore>,
        record_store: Arc<dyn ReconcileRecordStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            reservation_ledger,
            ledger_store,
            record_store,
            metrics,
        }
    }

    /// Releases every reservation whose TTL has lapsed. Consumed amount for
    /// a silent expiry is always zero — the caller never showed up to
    /// settle, so the whole hold is refunded.
    pub async fn run_overdue_sweep(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
        limit: i64,
    ) -> Result<ReconcileOutcome> {
        let outcome = self.reservation_ledger.sweep_overdue(older_than, limit).await?;
        for decision_id in &outcome.refunded {
            self.append_ledger_row(*decision_id).await;
            self.metrics.record_reconciliation(ReconcileTrigger::Auto, "refunded");
        }
        for (_, err) in &outcome.failed {
            tracing::warn!(error = %err, "overdue reservation reconcile failed");
            self.metrics.record_reconciliation(ReconcileTrigger::Auto, "failed");
        }
        Ok(outcome)
    }

    /// Manual reconcile entry point consulted by `POST /reservations/reconcile`.
    ///
    /// `header_key` takes precedence over `body_key` when both are present;
    /// if both are present and differ, the request is rejected outright as
    /// malformed rather than silently picking one.
    pub async fn reconcile_manual(
        &self,
        decision_id: Uuid,
        actual_usd: Decimal,
        header_key: Option<&str>,
        body_key: Option<&str>,
    ) -> Result<ManualReconcileOutcome> {
        let idempotency_key = match (header_key, body_key) {
            (Some(h), Some(b)) if h != b => {
                return Err(CoreError::InvalidRequest(
                    "Idempotency-Key header and body key disagree".into(),
                ))
            }
            (Some(h), _) => h.to_string(),
            (None, Some(b)) => b.to_string(),
            (None, None) => {
                return Err(CoreError::InvalidRequest("missing Idempotency-Key".into()))
            }
        };

        let reservation = self.reservation_ledger.get(decision_id).await?;
        let still_active = reservation
            .as_ref()
            .map(|rows| rows.iter().any(|r| r.state == crate::ledger::grants::AllocationState::Reserved))
            .unwrap_or(false);

        if !still_active {
            return match self.record_store.get(decision_id).await? {
                Some(prior) if prior.idempotency_key == idempotency_key && prior.actual_usd == actual_usd => {
                    Ok(prior.outcome)
                }
                Some(_) => Err(CoreError::Conflict(
                    "reconcile idempotency key matches but payload differs".into(),
                )),
                None => Err(CoreError::Conflict(
                    "reservation already reconciled by a different request".into(),
                )),
            };
        }

        // Zero actual usage is a full refund; anything above that settles
        // the consumed amount and, if it falls short of what was reserved,
        // partially refunds the difference (newest allocation first).
        let outcome = if actual_usd <= Decimal::ZERO {
            self.reservation_ledger.refund(decision_id).await?;
            ManualReconcileOutcome::Refunded
        } else {
            self.reservation_ledger.settle(decision_id, actual_usd).await?;
            ManualReconcileOutcome::Settled
        };

        self.record_store
            .put(
                decision_id,
                ReconcileRecord {
                    idempotency_key,
                    actual_usd,
                    outcome,
                },
            )
            .await?;
        self.append_ledger_row(decision_id).await;
        self.metrics.record_reconciliation(
            ReconcileTrigger::Manual,
            if outcome == ManualReconcileOutcome::Settled { "settled" } else { "refunded" },
        );
        Ok(outcome)
    }

    async fn append_ledger_row(&self, decision_id: Uuid) {
        match self.ledger_store.get(decision_id).await {
            Ok(Some(decision)) => {
                if let Err(e) = self.ledger_store.append(&decision).await {
                    tracing::error!(error = %e, %decision_id, "failed to append reconciliation ledger row");
                }
            }
            Ok(None) => tracing::error!(%decision_id, "reconciled decision not found for ledger append"),
            Err(e) => tracing::error!(error = %e, %decision_id, "failed to load decision for ledger append"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ledger_store::LedgerEntry;
    use crate::decision::model::{Decision, DecisionStatus, Environment, Source};
    use crate::failsafe::{Mode, ModeScope};
    use crate::ledger::grants::{AllocationState, CreditAllocation, CreditPoolType, ReservationAllocation};
    use crate::ledger::reservation::ReservationStore;
    use crate::metrics::NoopMetricsSink;
    use crate::waterfall::WaterfallOutcome;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeReservationStore {
        rows: Mutex<std::collections::HashMap<Uuid, Vec<ReservationAllocation>>>,
    }

    #[async_trait]
    impl ReservationStore for FakeReservationStore {
        async fn insert_reservation(&self, decision_id: Uuid, allocations: &[CreditAllocation]) -> Result<()> {
            let now = Utc::now();
            let rows = allocations
                .iter()
                .enumerate()
                .map(|(i, a)| ReservationAllocation {
                    decision_id,
                    grant_id: a.grant_id,
                    pool_type: a.pool_type,
                    amount_usd: a.amount_usd,
                    state: AllocationState::Reserved,
                    reserved_at: now + chrono::Duration::nanoseconds(i as i64),
                })
                .collect();
            self.rows.lock().unwrap().insert(decision_id, rows);
            Ok(())
        }
        async fn get_reservation(&self, decision_id: Uuid) -> Result<Option<Vec<ReservationAllocation>>> {
            Ok(self.rows.lock().unwrap().get(&decision_id).cloned())
        }
        async fn mark_settled(&self, decision_id: Uuid) -> Result<()> {
            if let Some(rows) = self.rows.lock().unwrap().get_mut(&decision_id) {
                for r in rows {
                    r.state = AllocationState::Settled;
                }
            }
            Ok(())
        }
        async fn mark_refunded(&self, decision_id: Uuid) -> Result<()> {
            if let Some(rows) = self.rows.lock().unwrap().get_mut(&decision_id) {
                for r in rows {
                    r.state = AllocationState::Refunded;
                }
            }
            Ok(())
        }
        async fn apply_settlement(
            &self,
            decision_id: Uuid,
            settled_grant_ids: &[Uuid],
            refunded_grant_ids: &[Uuid],
            partial: Option<(Uuid, Decimal)>,
        ) -> Result<()> {
            if let Some(rows) = self.rows.lock().unwrap().get_mut(&decision_id) {
                for r in rows.iter_mut() {
                    if settled_grant_ids.contains(&r.grant_id) {
                        r.state = AllocationState::Settled;
                    } else if refunded_grant_ids.contains(&r.grant_id) {
                        r.state = AllocationState::Refunded;
                    } else if let Some((grant_id, refund_usd)) = partial {
                        if r.grant_id == grant_id {
                            r.amount_usd -= refund_usd;
                            r.state = AllocationState::Settled;
                        }
                    }
                }
            }
            Ok(())
        }
        async fn lock_overdue(&self, _older_than: chrono::DateTime<Utc>, _limit: i64) -> Result<Vec<Uuid>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeLedgerStore {
        decisions: Mutex<std::collections::HashMap<Uuid, Decision>>,
        appends: Mutex<u32>,
    }

    #[async_trait]
    impl DecisionLedgerStore for FakeLedgerStore {
        async fn append(&self, decision: &Decision) -> Result<LedgerEntry> {
            *self.appends.lock().unwrap() += 1;
            Ok(LedgerEntry { sequence: 0, decision: decision.clone(), recorded_at: Utc::now() })
        }
        async fn find_by_idempotency_key(&self, _t: &str, _s: &str, _k: &str) -> Result<Option<Decision>> {
            Ok(None)
        }
        async fn get(&self, decision_id: Uuid) -> Result<Option<Decision>> {
            Ok(self.decisions.lock().unwrap().get(&decision_id).cloned())
        }
        async fn list_since(&self, _seq: i64, _limit: i64) -> Result<Vec<LedgerEntry>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeRecordStore {
        records: Mutex<std::collections::HashMap<Uuid, ReconcileRecord>>,
    }

    #[async_trait]
    impl ReconcileRecordStore for FakeRecordStore {
        async fn get(&self, decision_id: Uuid) -> Result<Option<ReconcileRecord>> {
            Ok(self.records.lock().unwrap().get(&decision_id).cloned())
        }
        async fn put(&self, decision_id: Uuid, record: ReconcileRecord) -> Result<()> {
            self.records.lock().unwrap().insert(decision_id, record);
            Ok(())
        }
    }

    fn sample_decision(id: Uuid) -> Decision {
        Decision {
            id,
            tenant_id: "tenant-1".into(),
            source: Source::Terraform,
            action: "create".into(),
            project_id: None,
            environment: Environment::new("prod"),
            resource_ref: "res".into(),
            idempotency_key: "k".into(),
            request_fingerprint: "fp".into(),
            status: DecisionStatus::AllowWithCredits,
            reason_code: "ok".into(),
            estimated_monthly_delta_usd: Decimal::from(400),
            estimated_hourly_delta_usd: Decimal::ZERO,
            computed_context: crate::context::ComputedContext::unavailable(),
            entitlement_waterfall: WaterfallOutcome { stages: vec![], overall_pass: true, reason_code: "ok".into(), credit_allocations: vec![] },
            credit_allocations: vec![],
            policy_version: 1,
            policy_document_sha256: "abc".into(),
            policy_document_schema_version: 1,
            mode_scope: ModeScope { mode: Mode::Hard, scope: "terraform_mode_prod" },
            approval_request_id: None,
            created_at: Utc::now(),
        }
    }

    fn worker() -> (ReconciliationWorker, Arc<FakeReservationStore>, Arc<FakeLedgerStore>) {
        let reservation_store = Arc::new(FakeReservationStore::default());
        let ledger_store = Arc::new(FakeLedgerStore::default());
        let record_store = Arc::new(FakeRecordStore::default());
        let reservation_ledger = Arc::new(ReservationLedger::new(reservation_store.clone()));
        let worker = ReconciliationWorker::new(
            reservation_ledger,
            ledger_store.clone(),
            record_store,
            Arc::new(NoopMetricsSink),
        );
        (worker, reservation_store, ledger_store)
    }

    #[tokio::test]
    async fn manual_reconcile_settles_when_actual_covers_reserved() {
        let (worker, reservation_store, ledger_store) = worker();
        let decision_id = Uuid::new_v4();
        ledger_store.decisions.lock().unwrap().insert(decision_id, sample_decision(decision_id));
        reservation_store
            .insert_reservation(
                decision_id,
                &[CreditAllocation { grant_id: Uuid::new_v4(), pool_type: CreditPoolType::Reserved, amount_usd: Decimal::from(400) }],
            )
            .await
            .unwrap();

        let outcome = worker
            .reconcile_manual(decision_id, Decimal::from(400), Some("req-1"), None)
            .await
            .unwrap();
        assert_eq!(outcome, ManualReconcileOutcome::Settled);
    }

    #[tokio::test]
    async fn manual_reconcile_refunds_when_actual_below_reserved() {
        let (worker, reservation_store, ledger_store) = worker();
        let decision_id = Uuid::new_v4();
        ledger_store.decisions.lock().unwrap().insert(decision_id, sample_decision(decision_id));
        reservation_store
            .insert_reservation(
                decision_id,
                &[CreditAllocation { grant_id: Uuid::new_v4(), pool_type: CreditPoolType::Reserved, amount_usd: Decimal::from(400) }],
            )
            .await
            .unwrap();

        let outcome = worker
            .reconcile_manual(decision_id, Decimal::ZERO, Some("req-2"), None)
            .await
            .unwrap();
        assert_eq!(outcome, ManualReconcileOutcome::Refunded);
    }

    #[tokio::test]
    async fn replay_with_identical_payload_returns_prior_result() {
        let (worker, reservation_store, ledger_store) = worker();
        let decision_id = Uuid::new_v4();
        ledger_store.decisions.lock().unwrap().insert(decision_id, sample_decision(decision_id));
        reservation_store
            .insert_reservation(
                decision_id,
                &[CreditAllocation { grant_id: Uuid::new_v4(), pool_type: CreditPoolType::Reserved, amount_usd: Decimal::from(400) }],
            )
            .await
            .unwrap();

        worker.reconcile_manual(decision_id, Decimal::from(400), Some("req-3"), None).await.unwrap();
        let replay = worker.reconcile_manual(decision_id, Decimal::from(400), Some("req-3"), None).await.unwrap();
        assert_eq!(replay, ManualReconcileOutcome::Settled);
    }

    #[tokio::test]
    async fn replay_with_mismatched_payload_conflicts() {
        let (worker, reservation_store, ledger_store) = worker();
        let decision_id = Uuid::new_v4();
        ledger_store.decisions.lock().unwrap().insert(decision_id, sample_decision(decision_id));
        reservation_store
            .insert_reservation(
                decision_id,
                &[CreditAllocation { grant_id: Uuid::new_v4(), pool_type: CreditPoolType::Reserved, amount_usd: Decimal::from(400) }],
            )
            .await
            .unwrap();

        worker.reconcile_manual(decision_id, Decimal::from(400), Some("req-4"), None).await.unwrap();
        let replay = worker.reconcile_manual(decision_id, Decimal::from(999), Some("req-4"), None).await;
        assert!(matches!(replay, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn header_and_body_key_mismatch_rejected() {
        let (worker, _reservation_store, _ledger_store) = worker();
        let decision_id = Uuid::new_v4();
        let result = worker
            .reconcile_manual(decision_id, Decimal::from(100), Some("h"), Some("b"))
            .await;
        assert!(matches!(result, Err(CoreError::InvalidRequest(_))));
    }
}
