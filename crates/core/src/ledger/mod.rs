//! Reservation & Credit Ledger.

pub mod grants;
pub mod reservation;

pub use grants::{
    AllocationState, CreditAllocation, CreditGrant, CreditGrantView, CreditPoolType,
    ReservationAllocation,
};
pub use reservation::{PostgresReservationStore, ReconcileOutcome, ReservationLedger, ReservationStore};
