//! Policy document store.

pub mod document;
pub mod store;

pub use document::{PolicyDocument, RequesterReviewerSeparation, RoutingRule};
pub use store::{PolicyStore, PostgresPolicyStore, GLOBAL_TENANT};
