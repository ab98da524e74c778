//! Strongly consistent metadata kept beside the object store.
//!
//! A metastore remembers what this process wrote and deleted so that
//! resolution and listing can mask the store's eventually consistent view:
//! live entries surface before the store lists them, tombstones hide keys
//! the store still lists after deletion, and authoritative directories let
//! listings skip the store entirely.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryMetastore;
pub use sqlite::SqliteMetastore;

use crate::models::{
    file_status::FileStatus,
    metadata::{DirListing, PathMetadata},
    path::FsPath,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("corrupt metastore entry for {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetaResult<T> = Result<T, MetaError>;

/// Every call is an atomic single-path operation; callers never assume
/// transactions spanning several paths.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Entry for `path`: live, tombstoned, or unknown (`None`).
    async fn get(&self, path: &FsPath) -> MetaResult<Option<PathMetadata>>;

    /// Record a live status, replacing any tombstone for the path.
    async fn put(&self, status: &FileStatus) -> MetaResult<()>;

    /// Record several statuses.
    async fn put_all(&self, statuses: &[FileStatus]) -> MetaResult<()> {
        for status in statuses {
            self.put(status).await?;
        }
        Ok(())
    }

    /// Replace the entry for `path` with a tombstone.
    async fn delete(&self, path: &FsPath) -> MetaResult<()>;

    /// Known children of `path`, tombstones included. `None` when nothing
    /// is known about the directory's contents.
    async fn list_children(&self, path: &FsPath) -> MetaResult<Option<DirListing>>;

    /// Declare (or stop declaring) the recorded children of `path` complete.
    async fn set_authoritative(&self, path: &FsPath, authoritative: bool) -> MetaResult<()>;
}

/// Parent column value of a path; the root has none.
pub(crate) fn parent_key(path: &FsPath) -> String {
    path.parent()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default()
}
