//! Reservation lifecycle: reserve, settle, refund, and the overdue sweep
//! consulted by the reconciliation worker.
//!
//! All mutating operations are idempotent by `decision_id`: replaying a
//! reserve/settle/refund call that already landed is a no-op, not an error,
//! so a client retry after a dropped response never double-books a grant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::ledger::grants::{AllocationState, CreditAllocation, CreditPoolType, ReservationAllocation};

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Debits each allocation's grant and inserts `Reserved` rows in one
    /// transaction. No-ops (returns `Ok(())`) if a reservation already
    /// exists for `decision_id`.
    async fn insert_reservation(
        &self,
        decision_id: Uuid,
        allocations: &[CreditAllocation],
    ) -> Result<()>;

    async fn get_reservation(&self, decision_id: Uuid) -> Result<Option<Vec<ReservationAllocation>>>;

    /// Transitions a decision's allocations from `Reserved` to `Settled`.
    /// Grant balances are not touched again: the debit already happened at
    /// reserve time.
    async fn mark_settled(&self, decision_id: Uuid) -> Result<()>;

    /// Transitions a decision's allocations from `Reserved` to `Refunded`,
    /// crediting each grant's `remaining_amount_usd` back.
    async fn mark_refunded(&self, decision_id: Uuid) -> Result<()>;

    /// Applies a partial settlement: allocations in `settled_grant_ids` flip
    /// straight to `Settled` (no grant credit, same as a full settle);
    /// allocations in `refunded_grant_ids` are fully re-credited and flip to
    /// `Refunded`; `partial` names at most one allocation that straddles the
    /// boundary — `refund_usd` is credited back to that one grant and its
    /// stored `amount_usd` is reduced by `refund_usd` before it flips to
    /// `Settled`.
    async fn apply_settlement(
        &self,
        decision_id: Uuid,
        settled_grant_ids: &[Uuid],
        refunded_grant_ids: &[Uuid],
        partial: Option<(Uuid, rust_decimal::Decimal)>,
    ) -> Result<()>;

    /// Locks and returns up to `limit` decision ids whose reservations are
    /// still `Reserved` and older than `older_than`, using
    /// `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent reconciler
    /// instances never pick the same row.
    async fn lock_overdue(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>>;
}

pub struct PostgresReservationStore {
    pool: PgPool,
}

impl PostgresReservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn pool_type_str(pool_type: CreditPoolType) -> &'static str {
    pool_type.as_str()
}

fn parse_pool_type(raw: &str) -> Result<CreditPoolType> {
    match raw {
        "reserved" => Ok(CreditPoolType::Reserved),
        "emergency" => Ok(CreditPoolType::Emergency),
        other => Err(CoreError::InvariantViolation(format!("unknown pool_type: {other}"))),
    }
}

fn parse_allocation_state(raw: &str) -> Result<AllocationState> {
    match raw {
        "reserved" => Ok(AllocationState::Reserved),
        "settled" => Ok(AllocationState::Settled),
        "refunded" => Ok(AllocationState::Refunded),
        other => Err(CoreError::InvariantViolation(format!("unknown allocation state: {other}"))),
    }
}

#[async_trait]
impl ReservationStore for PostgresReservationStore {
    /// Debits each grant's `remaining_amount_usd` and inserts its allocation
    /// row in one transaction; a grant whose balance can't cover its share
    /// (a concurrent reserve beat this one to it) aborts the whole batch.
    async fn insert_reservation(&self, decision_id: Uuid, allocations: &[CreditAllocation]) -> Result<()> {
        if allocations.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for allocation in allocations {
            let debited = sqlx::query(
                r#"
                update credit_grants
                set remaining_amount_usd = remaining_amount_usd - $1
                where id = $2 and remaining_amount_usd >= $1
                "#,
            )
            .bind(allocation.amount_usd)
            .bind(allocation.grant_id)
            .execute(&mut *tx)
            .await?;
            if debited.rows_affected() != 1 {
                return Err(CoreError::InvariantViolation(format!(
                    "grant {} cannot cover reservation of {}", allocation.grant_id, allocation.amount_usd
                )));
            }

            sqlx::query(
                r#"
                insert into reservation_allocations (decision_id, grant_id, pool_type, amount_usd, state)
                values ($1, $2, $3, $4, 'reserved')
                on conflict (decision_id, grant_id) do nothing
                "#,
            )
            .bind(decision_id)
            .bind(allocation.grant_id)
            .bind(pool_type_str(allocation.pool_type))
            .bind(allocation.amount_usd)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_reservation(&self, decision_id: Uuid) -> Result<Option<Vec<ReservationAllocation>>> {
        let rows = sqlx::query(
            r#"
            select decision_id, grant_id, pool_type, amount_usd, state, reserved_at
            from reservation_allocations
            where decision_id = $1
            "#,
        )
        .bind(decision_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let pool_type: String = row.get("pool_type");
            let state: String = row.get("state");
            out.push(ReservationAllocation {
                decision_id: row.get("decision_id"),
                grant_id: row.get("grant_id"),
                pool_type: parse_pool_type(&pool_type)?,
                amount_usd: row.get("amount_usd"),
                state: parse_allocation_state(&state)?,
                reserved_at: row.get("reserved_at"),
            });
        }
        Ok(Some(out))
    }

    async fn mark_settled(&self, decision_id: Uuid) -> Result<()> {
        sqlx::query(
            "update reservation_allocations set state = 'settled' where decision_id = $1 and state = 'reserved'",
        )
        .bind(decision_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-credits each grant's `remaining_amount_usd` before flipping the
    /// allocation to `refunded`, so a refunded reservation's balance is
    /// available for the next draw.
    async fn mark_refunded(&self, decision_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "select grant_id, amount_usd from reservation_allocations where decision_id = $1 and state = 'reserved'",
        )
        .bind(decision_id)
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            let grant_id: Uuid = row.get("grant_id");
            let amount_usd: rust_decimal::Decimal = row.get("amount_usd");
            sqlx::query("update credit_grants set remaining_amount_usd = remaining_amount_usd + $1 where id = $2")
                .bind(amount_usd)
                .bind(grant_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "update reservation_allocations set state = 'refunded' where decision_id = $1 and state = 'reserved'",
        )
        .bind(decision_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_settlement(
        &self,
        decision_id: Uuid,
        settled_grant_ids: &[Uuid],
        refunded_grant_ids: &[Uuid],
        partial: Option<(Uuid, rust_decimal::Decimal)>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if !settled_grant_ids.is_empty() {
            sqlx::query(
                "update reservation_allocations set state = 'settled' \
                 where decision_id = $1 and grant_id = any($2) and state = 'reserved'",
            )
            .bind(decision_id)
            .bind(settled_grant_ids)
            .execute(&mut *tx)
            .await?;
        }

        for grant_id in refunded_grant_ids {
            let row = sqlx::query(
                "select amount_usd from reservation_allocations \
                 where decision_id = $1 and grant_id = $2 and state = 'reserved'",
            )
            .bind(decision_id)
            .bind(grant_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(row) = row else { continue };
            let amount_usd: rust_decimal::Decimal = row.get("amount_usd");

            sqlx::query("update credit_grants set remaining_amount_usd = remaining_amount_usd + $1 where id = $2")
                .bind(amount_usd)
                .bind(grant_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "update reservation_allocations set state = 'refunded' \
                 where decision_id = $1 and grant_id = $2 and state = 'reserved'",
            )
            .bind(decision_id)
            .bind(grant_id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some((grant_id, refund_usd)) = partial {
            sqlx::query("update credit_grants set remaining_amount_usd = remaining_amount_usd + $1 where id = $2")
                .bind(refund_usd)
                .bind(grant_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "update reservation_allocations set amount_usd = amount_usd - $1, state = 'settled' \
                 where decision_id = $2 and grant_id = $3 and state = 'reserved'",
            )
            .bind(refund_usd)
            .bind(decision_id)
            .bind(grant_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn lock_overdue(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>> {
        // `for update` cannot be combined with `group by`, so the candidate
        // set is picked in a CTE and the locking select is a plain `in (...)`
        // lookup against it.
        let rows = sqlx::query(
            r#"
            with overdue as (
                select decision_id, min(reserved_at) as oldest
                from reservation_allocations
                where state = 'reserved' and reserved_at < $1
                group by decision_id
                order by oldest
                limit $2
            )
            select decision_id
            from reservation_allocations
            where decision_id in (select decision_id from overdue)
            for update skip locked
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            let decision_id: Uuid = row.get("decision_id");
            if seen.insert(decision_id) {
                out.push(decision_id);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub refunded: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

pub struct ReservationLedger {
    store: std::sync::Arc<dyn ReservationStore>,
}

impl ReservationLedger {
    pub fn new(store: std::sync::Arc<dyn ReservationStore>) -> Self {
        Self { store }
    }

    /// Current reservation allocations for a decision, if any exist.
    pub async fn get(&self, decision_id: Uuid) -> Result<Option<Vec<ReservationAllocation>>> {
        self.store.get_reservation(decision_id).await
    }

    pub async fn reserve(&self, decision_id: Uuid, allocations: &[CreditAllocation]) -> Result<()> {
        if self.store.get_reservation(decision_id).await?.is_some() {
            return Ok(());
        }
        if allocations.is_empty() {
            return Ok(());
        }
        self.store.insert_reservation(decision_id, allocations).await
    }

    /// Settles a reservation against the actual consumption `actual_usd`.
    /// When `actual_usd` covers the full reserved total every allocation
    /// simply flips to `Settled`. When it falls short, the difference is
    /// refunded starting from the most recently reserved allocation — the
    /// oldest-expiry credits the waterfall drew first stay settled, and any
    /// allocation straddling the boundary is split into a refunded portion
    /// and a settled remainder.
    pub async fn settle(&self, decision_id: Uuid, actual_usd: rust_decimal::Decimal) -> Result<()> {
        let rows = match self.store.get_reservation(decision_id).await? {
            None => return Ok(()),
            Some(rows) if rows.is_empty() => return Ok(()),
            Some(rows) => rows,
        };

        if all_in_state(&rows, AllocationState::Refunded) {
            return Err(CoreError::Conflict(format!("decision {decision_id} already refunded")));
        }
        if !any_in_state(&rows, AllocationState::Reserved) {
            // Already resolved by a prior settle call, in full or in part.
            return Ok(());
        }

        let reserved_total: rust_decimal::Decimal = rows.iter().map(|r| r.amount_usd).sum();
        let actual_usd = actual_usd.max(rust_decimal::Decimal::ZERO);

        if actual_usd >= reserved_total {
            return self.store.mark_settled(decision_id).await;
        }

        let mut newest_first = rows.clone();
        newest_first.sort_by(|a, b| b.reserved_at.cmp(&a.reserved_at));

        let mut shortfall = reserved_total - actual_usd;
        let mut settled_grant_ids = Vec::new();
        let mut refunded_grant_ids = Vec::new();
        let mut partial = None;

        for row in &newest_first {
            if shortfall.is_zero() {
                settled_grant_ids.push(row.grant_id);
            } else if row.amount_usd <= shortfall {
                refunded_grant_ids.push(row.grant_id);
                shortfall -= row.amount_usd;
            } else {
                partial = Some((row.grant_id, shortfall));
                shortfall = rust_decimal::Decimal::ZERO;
            }
        }

        self.store.apply_settlement(decision_id, &settled_grant_ids, &refunded_grant_ids, partial).await
    }

    pub async fn refund(&self, decision_id: Uuid) -> Result<()> {
        match self.store.get_reservation(decision_id).await? {
            None => Ok(()),
            Some(rows) if all_in_state(&rows, AllocationState::Refunded) => Ok(()),
            Some(rows) if any_in_state(&rows, AllocationState::Settled) => Err(
                CoreError::Conflict(format!("decision {decision_id} already settled")),
            ),
            Some(_) => self.store.mark_refunded(decision_id).await,
        }
    }

    /// Refunds every reservation older than `older_than` still in `Reserved`
    /// state, one at a time so a single bad row doesn't abort the batch.
    pub async fn sweep_overdue(&self, older_than: DateTime<Utc>, limit: i64) -> Result<ReconcileOutcome> {
        let ids = self.store.lock_overdue(older_than, limit).await?;
        let mut outcome = ReconcileOutcome::default();
        for id in ids {
            match self.store.mark_refunded(id).await {
                Ok(()) => outcome.refunded.push(id),
                Err(e) => outcome.failed.push((id, e.to_string())),
            }
        }
        Ok(outcome)
    }
}

fn all_in_state(rows: &[ReservationAllocation], state: AllocationState) -> bool {
    rows.iter().all(|r| r.state == state)
}

fn any_in_state(rows: &[ReservationAllocation], state: AllocationState) -> bool {
    rows.iter().any(|r| r.state == state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::grants::CreditPoolType;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        reservations: Mutex<std::collections::HashMap<Uuid, Vec<ReservationAllocation>>>,
    }

    #[async_trait]
    impl ReservationStore for FakeStore {
        async fn insert_reservation(
            &self,
            decision_id: Uuid,
            allocations: &[CreditAllocation],
        ) -> Result<()> {
            let now = chrono::Utc::now();
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
            self.reservations.lock().unwrap().insert(decision_id, rows);
            Ok(())
        }

        async fn get_reservation(&self, decision_id: Uuid) -> Result<Option<Vec<ReservationAllocation>>> {
            Ok(self.reservations.lock().unwrap().get(&decision_id).cloned())
        }

        async fn mark_settled(&self, decision_id: Uuid) -> Result<()> {
            if let Some(rows) = self.reservations.lock().unwrap().get_mut(&decision_id) {
                for r in rows {
                    r.state = AllocationState::Settled;
                }
            }
            Ok(())
        }

        async fn mark_refunded(&self, decision_id: Uuid) -> Result<()> {
            if let Some(rows) = self.reservations.lock().unwrap().get_mut(&decision_id) {
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
            if let Some(rows) = self.reservations.lock().unwrap().get_mut(&decision_id) {
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

        async fn lock_overdue(&self, _older_than: DateTime<Utc>, _limit: i64) -> Result<Vec<Uuid>> {
            Ok(self
                .reservations
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, rows)| all_in_state(rows, AllocationState::Reserved))
                .map(|(id, _)| *id)
                .collect())
        }
    }

    fn allocation(id: Uuid) -> CreditAllocation {
        CreditAllocation {
            grant_id: id,
            pool_type: CreditPoolType::Reserved,
            amount_usd: Decimal::from(100),
        }
    }

    fn fake_ledger() -> (ReservationLedger, std::sync::Arc<FakeStore>) {
        let store = std::sync::Arc::new(FakeStore::default());
        (ReservationLedger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn reserve_is_idempotent() {
        let (ledger, store) = fake_ledger();
        let decision_id = Uuid::new_v4();
        let allocs = vec![allocation(Uuid::new_v4())];
        ledger.reserve(decision_id, &allocs).await.unwrap();
        ledger.reserve(decision_id, &allocs).await.unwrap();
        let rows = store.get_reservation(decision_id).await.unwrap().unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn settle_then_refund_conflicts() {
        let (ledger, _store) = fake_ledger();
        let decision_id = Uuid::new_v4();
        ledger.reserve(decision_id, &[allocation(Uuid::new_v4())]).await.unwrap();
        ledger.settle(decision_id, Decimal::from(100)).await.unwrap();
        assert!(ledger.refund(decision_id).await.is_err());
    }

    #[tokio::test]
    async fn settle_covering_full_amount_settles_every_allocation() {
        let (ledger, store) = fake_ledger();
        let decision_id = Uuid::new_v4();
        ledger.reserve(decision_id, &[allocation(Uuid::new_v4())]).await.unwrap();
        ledger.settle(decision_id, Decimal::from(100)).await.unwrap();
        let rows = store.get_reservation(decision_id).await.unwrap().unwrap();
        assert!(all_in_state(&rows, AllocationState::Settled));
    }

    #[tokio::test]
    async fn settle_shortfall_refunds_newest_allocation_first() {
        let (ledger, store) = fake_ledger();
        let decision_id = Uuid::new_v4();
        let older_grant = Uuid::new_v4();
        let newer_grant = Uuid::new_v4();
        ledger
            .reserve(decision_id, &[allocation(older_grant), allocation(newer_grant)])
            .await
            .unwrap();
        // reserved_at ordering comes from insertion order in the fake store:
        // older_grant was reserved first, newer_grant second.
        ledger.settle(decision_id, Decimal::from(100)).await.unwrap();

        let rows = store.get_reservation(decision_id).await.unwrap().unwrap();
        let older = rows.iter().find(|r| r.grant_id == older_grant).unwrap();
        let newer = rows.iter().find(|r| r.grant_id == newer_grant).unwrap();
        assert_eq!(older.state, AllocationState::Settled);
        assert_eq!(older.amount_usd, Decimal::from(100));
        assert_eq!(newer.state, AllocationState::Refunded);
    }

    #[tokio::test]
    async fn settle_shortfall_splits_straddling_allocation() {
        let (ledger, store) = fake_ledger();
        let decision_id = Uuid::new_v4();
        let older_grant = Uuid::new_v4();
        let newer_grant = Uuid::new_v4();
        ledger
            .reserve(decision_id, &[allocation(older_grant), allocation(newer_grant)])
            .await
            .unwrap();
        // Reserved total is 200; actual usage of 150 leaves a 50 shortfall,
        // which lands entirely inside the newer allocation (reserved last).
        ledger.settle(decision_id, Decimal::from(150)).await.unwrap();

        let rows = store.get_reservation(decision_id).await.unwrap().unwrap();
        let older = rows.iter().find(|r| r.grant_id == older_grant).unwrap();
        let newer = rows.iter().find(|r| r.grant_id == newer_grant).unwrap();
        assert_eq!(older.state, AllocationState::Settled);
        assert_eq!(older.amount_usd, Decimal::from(100));
        assert_eq!(newer.state, AllocationState::Settled);
        assert_eq!(newer.amount_usd, Decimal::from(50));
    }

    #[tokio::test]
    async fn settle_is_idempotent_after_partial_refund() {
        let (ledger, _store) = fake_ledger();
        let decision_id = Uuid::new_v4();
        ledger.reserve(decision_id, &[allocation(Uuid::new_v4()), allocation(Uuid::new_v4())]).await.unwrap();
        ledger.settle(decision_id, Decimal::from(150)).await.unwrap();
        ledger.settle(decision_id, Decimal::from(150)).await.unwrap();
    }

    #[tokio::test]
    async fn refund_is_idempotent() {
        let (ledger, _store) = fake_ledger();
        let decision_id = Uuid::new_v4();
        ledger.reserve(decision_id, &[allocation(Uuid::new_v4())]).await.unwrap();
        ledger.refund(decision_id).await.unwrap();
        ledger.refund(decision_id).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_refunds_overdue_reservations() {
        let (ledger, _store) = fake_ledger();
        let decision_id = Uuid::new_v4();
        ledger.reserve(decision_id, &[allocation(Uuid::new_v4())]).await.unwrap();
        let outcome = ledger.sweep_overdue(Utc::now(), 10).await.unwrap();
        assert_eq!(outcome.refunded, vec![decision_id]);
    }
}
