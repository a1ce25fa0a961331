//! Components F/G — the decision engine and its append-only ledger.

pub mod engine;
pub mod ledger_store;
pub mod model;

pub use engine::{DecisionEngine, EvaluateError, GateDependencies, PostgresEntitlementState, PostgresGateLock};
pub use ledger_store::{DecisionLedgerStore, LedgerEntry, PostgresDecisionLedgerStore};
pub use model::{Decision, DecisionInput, DecisionStatus, Environment, Source};
