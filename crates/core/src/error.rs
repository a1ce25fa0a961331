//! Error taxonomy for the enforcement core.
//!
//! Kinds mirror the taxonomy in the design notes: validation errors surface
//! as typed 4xx to callers, lock/dependency errors never surface raw (the
//! decision engine converts them into `FAIL_SAFE_*` decisions), and invariant
//! violations are treated as bugs that page operators rather than being
//! swallowed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("idempotency conflict: existing request fingerprint does not match")]
    IdempotencyConflict,

    #[error("reservation lock contended")]
    LockContended,

    #[error("reservation lock timed out")]
    LockTimeout,

    #[error("approval token invalid: {0}")]
    TokenInvalid(String),

    #[error("approval token binding mismatch: {0}")]
    TokenBindingMismatch(String),

    #[error("approval already consumed")]
    TokenAlreadyConsumed,

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CoreError {
    /// Stable machine-readable error code, independent of the Display message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::LockContended => "gate_lock_contended",
            Self::LockTimeout => "gate_lock_timeout",
            Self::TokenInvalid(_) => "token_invalid",
            Self::TokenBindingMismatch(_) => "token_binding_mismatch",
            Self::TokenAlreadyConsumed => "token_already_consumed",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Throttled(_) => "throttled",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Database(_) => "database_error",
        }
    }

    /// Whether this error must never reach the caller verbatim and instead
    /// has to be converted into a FAIL_SAFE_* decision by the engine.
    pub fn is_fail_safe_trigger(&self) -> bool {
        matches!(
            self,
            Self::LockContended
                | Self::LockTimeout
                | Self::DependencyUnavailable(_)
                | Self::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
