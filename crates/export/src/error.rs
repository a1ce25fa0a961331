//! Error type for the export crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("core error: {0}")]
    Core(#[from] enforcement_core::CoreError),

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
}

pub type Result<T> = std::result::Result<T, ExportError>;
