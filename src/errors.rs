//! Error taxonomy of the filesystem layer.
//!
//! `NotFound` is the only condition callers routinely absorb; everything
//! else propagates un-downgraded. Store and metastore faults convert in via
//! `From`, keeping throttling and interruption distinct from absence.

use crate::{
    backends::StoreError,
    metastore::MetaError,
    models::{outcome::BulkDeleteOutcome, path::FsPath},
};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(FsPath),

    #[error("cannot operate on {path}: {reason}")]
    PreconditionFailed { path: FsPath, reason: String },

    #[error("{path} already exists: {reason}")]
    AlreadyExists { path: FsPath, reason: String },

    #[error("{0} is a directory")]
    IsDirectory(FsPath),

    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(FsPath),

    #[error("{operation}: {} keys could not be processed", .outcome.failed_keys.len())]
    PartialFailure {
        operation: String,
        outcome: BulkDeleteOutcome,
    },

    #[error("{operation}: keys were deleted but the metastore was not updated: {source}")]
    MetastoreOutOfSync {
        operation: String,
        outcome: BulkDeleteOutcome,
        source: MetaError,
    },

    #[error("transient store failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("access denied during {operation}: {message}")]
    AccessDenied { operation: String, message: String },

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("filesystem is closed")]
    Closed,

    #[error("store failure during {operation}: {message}")]
    Store { operation: String, message: String },

    #[error(transparent)]
    Metastore(#[from] MetaError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn precondition(path: &FsPath, reason: impl Into<String>) -> Self {
        FsError::PreconditionFailed {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    pub fn already_exists(path: &FsPath, reason: impl Into<String>) -> Self {
        FsError::AlreadyExists {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// Translate a store fault seen while operating on `path`.
    pub fn from_store(operation: &str, path: &FsPath, err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => FsError::NotFound(path.clone()),
            StoreError::Throttled(message) | StoreError::Unavailable(message) => {
                FsError::Transient {
                    operation: operation.to_string(),
                    message,
                }
            }
            StoreError::AccessDenied(message) => FsError::AccessDenied {
                operation: operation.to_string(),
                message,
            },
            StoreError::Interrupted(message) => FsError::Interrupted(message),
            StoreError::InvalidKey(key) => {
                FsError::InvalidRequest(format!("{}: invalid key `{}`", operation, key))
            }
            other => FsError::Store {
                operation: operation.to_string(),
                message: other.to_string(),
            },
        }
    }
}
