//! Entries held by the consistency metastore.

use crate::models::{
    file_status::{FileStatus, Tristate},
    path::FsPath,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// A metastore record for one path: a live status or a tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathMetadata {
    pub status: FileStatus,

    /// Deleted locally; the store may still list it.
    pub is_deleted: bool,

    /// When the record was last written.
    pub last_updated: DateTime<Utc>,
}

impl PathMetadata {
    pub fn live(status: FileStatus) -> Self {
        Self {
            status,
            is_deleted: false,
            last_updated: Utc::now(),
        }
    }

    /// A tombstone for `path`. The status carries the deletion time as its
    /// modification time.
    pub fn tombstone(path: FsPath, owner: &str) -> Self {
        let now = Utc::now();
        let mut status = FileStatus::file(path, 0, now, 0, owner, None, None);
        status.is_empty_directory = Tristate::Unknown;
        Self {
            status,
            is_deleted: true,
            last_updated: now,
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.status.path
    }

    pub fn is_empty_directory(&self) -> Tristate {
        if self.status.is_directory {
            self.status.is_empty_directory
        } else {
            Tristate::False
        }
    }
}

/// The metastore's view of a directory's immediate children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirListing {
    pub path: FsPath,
    pub entries: Vec<PathMetadata>,

    /// The entries are the complete set of children.
    pub is_authoritative: bool,
}

impl DirListing {
    pub fn tombstones(&self) -> HashSet<FsPath> {
        self.entries
            .iter()
            .filter(|e| e.is_deleted)
            .map(|e| e.path().clone())
            .collect()
    }

    pub fn live_statuses(&self) -> Vec<FileStatus> {
        self.entries
            .iter()
            .filter(|e| !e.is_deleted)
            .map(|e| e.status.clone())
            .collect()
    }

    /// Emptiness as far as the metastore can tell: any live child means
    /// non-empty; no live child only means empty if the listing is
    /// authoritative.
    pub fn emptiness(&self) -> Tristate {
        if self.entries.iter().any(|e| !e.is_deleted) {
            Tristate::False
        } else if self.is_authoritative {
            Tristate::True
        } else {
            Tristate::Unknown
        }
    }
}
