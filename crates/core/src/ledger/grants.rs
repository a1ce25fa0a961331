//! Credit Grant and Reservation Allocation entities.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditPoolType {
    Reserved,
    Emergency,
}

impl CreditPoolType {
    pub fn as_str(self) -> &'static str {
        match self {
            CreditPoolType::Reserved => "reserved",
            CreditPoolType::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Reserved,
    Settled,
    Refunded,
}

/// Read-only view of a credit grant consulted by the waterfall evaluator,
/// ordered on the caller's side by `expires_at` ascending, then `created_at`
/// ascending, then `id` ascending (oldest-expiry-first precedence).
#[derive(Debug, Clone)]
pub struct CreditGrantView {
    pub id: Uuid,
    pub pool_type: CreditPoolType,
    pub remaining_amount_usd: Decimal,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A proposed or executed draw against a single grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditAllocation {
    pub grant_id: Uuid,
    pub pool_type: CreditPoolType,
    pub amount_usd: Decimal,
}

/// Full credit grant record, as persisted.
#[derive(Debug, Clone)]
pub struct CreditGrant {
    pub id: Uuid,
    pub tenant_id: String,
    pub pool_type: CreditPoolType,
    pub initial_amount_usd: Decimal,
    pub remaining_amount_usd: Decimal,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A single reservation's allocation against one grant.
#[derive(Debug, Clone)]
pub struct ReservationAllocation {
    pub decision_id: Uuid,
    pub grant_id: Uuid,
    pub pool_type: CreditPoolType,
    pub amount_usd: Decimal,
    pub state: AllocationState,
    pub reserved_at: DateTime<Utc>,
}

/// Greedily draws up to `needed` from `grants` (already sorted
/// oldest-expiry-first by the caller), never exceeding any single grant's
/// remaining balance. Returns the allocations made and the amount still
/// unmet.
pub fn greedy_draw(
    grants: &[CreditGrantView],
    needed: Decimal,
) -> (Vec<CreditAllocation>, Decimal) {
    let mut remaining_need = needed;
    let mut allocations = Vec::new();
    for grant in grants {
        if remaining_need.is_sign_negative() || remaining_need.is_zero() {
            break;
        }
        if grant.remaining_amount_usd.is_sign_negative() || grant.remaining_amount_usd.is_zero() {
            continue;
        }
        let draw = remaining_need.min(grant.remaining_amount_usd);
        allocations.push(CreditAllocation {
            grant_id: grant.id,
            pool_type: grant.pool_type,
            amount_usd: crate::money::normalize(draw),
        });
        remaining_need = crate::money::normalize(remaining_need - draw);
    }
    (allocations, remaining_need.max(Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(id: u8, remaining: i64, expires_in_days: i64) -> CreditGrantView {
        CreditGrantView {
            id: Uuid::from_u128(id as u128),
            pool_type: CreditPoolType::Reserved,
            remaining_amount_usd: Decimal::from(remaining),
            expires_at: Utc::now() + chrono::Duration::days(expires_in_days),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn draws_fully_from_single_grant() {
        let grants = vec![grant(1, 500, 30)];
        let (allocations, unmet) = greedy_draw(&grants, Decimal::from(400));
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].amount_usd, Decimal::from(400));
        assert_eq!(unmet, Decimal::ZERO);
    }

    #[test]
    fn spills_across_multiple_grants_in_order() {
        let grants = vec![grant(1, 100, 10), grant(2, 500, 30)];
        let (allocations, unmet) = greedy_draw(&grants, Decimal::from(300));
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].amount_usd, Decimal::from(100));
        assert_eq!(allocations[1].amount_usd, Decimal::from(200));
        assert_eq!(unmet, Decimal::ZERO);
    }

    #[test]
    fn reports_unmet_when_exhausted() {
        let grants = vec![grant(1, 100, 10)];
        let (allocations, unmet) = greedy_draw(&grants, Decimal::from(300));
        assert_eq!(allocations.len(), 1);
        assert_eq!(unmet, Decimal::from(200));
    }
}
