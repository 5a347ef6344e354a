//! Error taxonomy for a migration run.
//!
//! Only [`FatalError`] aborts a run, and only before the first write. Every
//! other failure is recovered inline and counted under an [`ErrorClass`].

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Non-fatal classes tallied in run statistics, plus the fatal one for completeness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RowValidation,
    OrphanReference,
    IntegrityViolation,
    TransientWrite,
    CapacityViolation,
    FatalConfiguration,
}

/// Unrecoverable configuration or connectivity failure.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("source database not found at {0}")]
    SourceMissing(PathBuf),

    #[error("cannot open source {path}: {source}")]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("source schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("cannot open target store: {0}")]
    Target(String),
}

impl FatalError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::FatalConfiguration
    }
}

/// A source row that cannot become a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowValidationError {
    #[error("missing required key column `{0}`")]
    MissingKey(&'static str),

    #[error("pseudo author `{0}` has no user profile")]
    PseudoAuthor(String),
}

/// Failures surfaced by a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Busy/locked/timeout style failures that a retry may clear.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Permanent(String),

    #[error("document encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Permanent(e.to_string()),
        }
    }
}
