//! Status records produced by resolution and listing.

use crate::models::path::FsPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Three-valued flag for directory emptiness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tristate {
    True,
    False,
    Unknown,
}

impl Tristate {
    pub fn from_bool(value: bool) -> Self {
        if value { Tristate::True } else { Tristate::False }
    }

    pub fn as_option(self) -> Option<bool> {
        match self {
            Tristate::True => Some(true),
            Tristate::False => Some(false),
            Tristate::Unknown => None,
        }
    }
}

/// Status of a file or directory at one point in time.
///
/// Built fresh on every resolution and never mutated afterwards; use the
/// `with_*` builders to derive a replacement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: FsPath,
    pub length: u64,
    pub modification_time: DateTime<Utc>,
    pub is_directory: bool,
    pub is_empty_directory: Tristate,
    pub owner: String,
    pub block_size: u64,
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

impl FileStatus {
    pub fn file(
        path: FsPath,
        length: u64,
        modification_time: DateTime<Utc>,
        block_size: u64,
        owner: impl Into<String>,
        etag: Option<String>,
        version_id: Option<String>,
    ) -> Self {
        Self {
            path,
            length,
            modification_time,
            is_directory: false,
            is_empty_directory: Tristate::False,
            owner: owner.into(),
            block_size,
            etag,
            version_id,
        }
    }

    /// A directory status. Object stores keep no directory timestamps, so
    /// the modification time is the moment of resolution.
    pub fn directory(path: FsPath, empty: Tristate, owner: impl Into<String>) -> Self {
        Self {
            path,
            length: 0,
            modification_time: Utc::now(),
            is_directory: true,
            is_empty_directory: empty,
            owner: owner.into(),
            block_size: 0,
            etag: None,
            version_id: None,
        }
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory
    }

    pub fn with_empty_directory(&self, empty: Tristate) -> Self {
        Self {
            is_empty_directory: empty,
            ..self.clone()
        }
    }

    pub fn with_path(&self, path: FsPath) -> Self {
        Self {
            path,
            ..self.clone()
        }
    }
}

/// One of the existence probes `raw_status` may issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusProbe {
    /// HEAD the exact key.
    Head,
    /// HEAD `key/`.
    DirMarker,
    /// LIST `key/` with delimiter, one result.
    List,
}

/// The set of probes a caller allows, cheapest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeSet {
    head: bool,
    dir_marker: bool,
    list: bool,
}

impl ProbeSet {
    pub const ALL: ProbeSet = ProbeSet {
        head: true,
        dir_marker: true,
        list: true,
    };

    /// Directory-only probes; skips the plain HEAD so that an expected 404
    /// is never cached by the store's front end.
    pub const DIRECTORIES: ProbeSet = ProbeSet {
        head: false,
        dir_marker: true,
        list: true,
    };

    pub const LIST_ONLY: ProbeSet = ProbeSet {
        head: false,
        dir_marker: false,
        list: true,
    };

    pub const HEAD_ONLY: ProbeSet = ProbeSet {
        head: true,
        dir_marker: false,
        list: false,
    };

    pub const NONE: ProbeSet = ProbeSet {
        head: false,
        dir_marker: false,
        list: false,
    };

    pub fn of(probes: &[StatusProbe]) -> Self {
        probes.iter().fold(ProbeSet::NONE, |set, p| set.with(*p))
    }

    pub fn with(self, probe: StatusProbe) -> Self {
        match probe {
            StatusProbe::Head => ProbeSet { head: true, ..self },
            StatusProbe::DirMarker => ProbeSet {
                dir_marker: true,
                ..self
            },
            StatusProbe::List => ProbeSet { list: true, ..self },
        }
    }

    pub fn contains(&self, probe: StatusProbe) -> bool {
        match probe {
            StatusProbe::Head => self.head,
            StatusProbe::DirMarker => self.dir_marker,
            StatusProbe::List => self.list,
        }
    }
}
