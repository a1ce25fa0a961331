//! Tower layers applied on top of the axum router.

pub mod rate_limit;

pub use rate_limit::{GateRateLimiter, RateLimitLayer};
