//! HTTP error mapping for the enforcement API.
//!
//! Converts [`enforcement_core::CoreError`] and this crate's own request
//! validation failures into the stable `{error, reason_code}` JSON shape
//! every gate/admin endpoint returns.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use enforcement_core::CoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error(transparent)]
    Export(#[from] enforcement_export::ExportError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    reason_code: String,
}

impl ApiError {
    pub(crate) fn reason_code(&self) -> &str {
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Core(e) => e.code(),
            ApiError::Internal(_) => "internal_error",
            ApiError::Throttled(_) => "throttled",
            ApiError::Export(e) => match e {
                enforcement_export::ExportError::Core(core_err) => core_err.code(),
                enforcement_export::ExportError::SignatureMismatch => "signature_mismatch",
                enforcement_export::ExportError::SourceUnavailable(_) => "source_unavailable",
            },
        }
    }

    pub(crate) fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Core(e) => core_error_status(e),
            ApiError::Export(e) => match e {
                enforcement_export::ExportError::Core(core_err) => core_error_status(core_err),
                enforcement_export::ExportError::SignatureMismatch => StatusCode::INTERNAL_SERVER_ERROR,
                enforcement_export::ExportError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

fn core_error_status(e: &CoreError) -> StatusCode {
    match e {
        CoreError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::IdempotencyConflict | CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::TokenInvalid(_) | CoreError::TokenBindingMismatch(_) => StatusCode::UNAUTHORIZED,
        CoreError::TokenAlreadyConsumed => StatusCode::CONFLICT,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::LockContended
        | CoreError::LockTimeout
        | CoreError::DependencyUnavailable(_)
        | CoreError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Core(CoreError::InvariantViolation(ref msg)) = self {
            tracing::error!(violation = %msg, "invariant violation");
        }
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            reason_code: self.reason_code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
