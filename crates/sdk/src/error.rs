//! Error types for the enforcement SDK.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("request failed: {url}, status: {status:?}, error: {error}")]
    HttpRequest {
        url: String,
        status: Option<u16>,
        error: String,
    },

    #[error("network timeout after {timeout_secs}s: {context}")]
    NetworkTimeout { timeout_secs: u64, context: String },

    #[error("network connection error: {0}")]
    NetworkConnection(String),

    #[error("gate rejected the request: reason_code={reason_code}, status={status}")]
    Gate { status: u16, reason_code: String, message: String },

    #[error("gate decision {status} is not an ALLOW outcome (reason_code={reason_code})")]
    NotAllowed { status: String, reason_code: String },

    #[error("invalid response body: {0}")]
    InvalidResponse(String),

    #[error("invalid decimal amount: {0}")]
    InvalidDecimal(String),
}

impl SdkError {
    /// Timeouts, connection failures, and 5xx gate errors are worth
    /// retrying; 4xx-class errors (idempotency conflicts, invalid request,
    /// token invalid) are permanent and must not be retried blindly.
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::NetworkTimeout { .. } | SdkError::NetworkConnection(_) => true,
            SdkError::HttpRequest { status, .. } => status.map(|s| s >= 500).unwrap_or(true),
            SdkError::Gate { status, .. } => *status >= 500,
            SdkError::NotAllowed { .. } | SdkError::InvalidResponse(_) | SdkError::InvalidDecimal(_) => false,
        }
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        let status = err.status().map(|s| s.as_u16());

        if err.is_timeout() {
            SdkError::NetworkTimeout { timeout_secs: 30, context: url }
        } else if err.is_connect() {
            SdkError::NetworkConnection(format!("failed to connect to {url}: {err}"))
        } else {
            SdkError::HttpRequest { url, status, error: err.to_string() }
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = SdkError::Gate { status: 503, reason_code: "gate_lock_timeout".into(), message: "busy".into() };
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = SdkError::Gate { status: 409, reason_code: "idempotency_conflict".into(), message: "mismatch".into() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_allowed_is_not_retryable() {
        let err = SdkError::NotAllowed { status: "DENY".into(), reason_code: "over_plan_ceiling".into() };
        assert!(!err.is_retryable());
    }
}
