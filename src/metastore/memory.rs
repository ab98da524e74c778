//! In-process metastore.

use super::{MetaResult, MetadataStore};
use crate::models::{
    file_status::FileStatus,
    metadata::{DirListing, PathMetadata},
    path::FsPath,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Mutex, MutexGuard},
};
use tracing::debug;

#[derive(Default)]
struct MetaState {
    entries: BTreeMap<FsPath, PathMetadata>,
    authoritative: HashSet<FsPath>,
}

/// Metastore held in a map, shared by everything using one process.
/// Tombstones older than the optional TTL are forgotten on access.
#[derive(Default)]
pub struct MemoryMetastore {
    state: Mutex<MetaState>,
    tombstone_ttl: Option<Duration>,
    owner: String,
}

impl MemoryMetastore {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Self::default()
        }
    }

    pub fn with_tombstone_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.tombstone_ttl = Duration::from_std(ttl).ok();
        self
    }

    fn state(&self) -> MutexGuard<'_, MetaState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, entry: &PathMetadata) -> bool {
        match self.tombstone_ttl {
            Some(ttl) => entry.is_deleted && entry.last_updated + ttl < Utc::now(),
            None => false,
        }
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for MemoryMetastore {
    async fn get(&self, path: &FsPath) -> MetaResult<Option<PathMetadata>> {
        let mut state = self.state();
        let entry = state.entries.get(path).cloned();
        match entry {
            Some(entry) if self.expired(&entry) => {
                debug!("tombstone for {} expired", path);
                state.entries.remove(path);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(&self, status: &FileStatus) -> MetaResult<()> {
        self.state()
            .entries
            .insert(status.path.clone(), PathMetadata::live(status.clone()));
        Ok(())
    }

    async fn delete(&self, path: &FsPath) -> MetaResult<()> {
        let mut state = self.state();
        state
            .entries
            .insert(path.clone(), PathMetadata::tombstone(path.clone(), &self.owner));
        state.authoritative.remove(path);
        Ok(())
    }

    async fn list_children(&self, path: &FsPath) -> MetaResult<Option<DirListing>> {
        let mut state = self.state();
        let expired = state
            .entries
            .values()
            .filter(|e| self.expired(e))
            .map(|e| e.path().clone())
            .collect::<Vec<_>>();
        for gone in expired {
            state.entries.remove(&gone);
        }

        let entries = state
            .entries
            .values()
            .filter(|e| e.path().parent().as_ref() == Some(path))
            .cloned()
            .collect::<Vec<_>>();
        let is_authoritative = state.authoritative.contains(path);
        if entries.is_empty() && !is_authoritative {
            return Ok(None);
        }
        Ok(Some(DirListing {
            path: path.clone(),
            entries,
            is_authoritative,
        }))
    }

    async fn set_authoritative(&self, path: &FsPath, authoritative: bool) -> MetaResult<()> {
        let mut state = self.state();
        if authoritative {
            state.authoritative.insert(path.clone());
        } else {
            state.authoritative.remove(path);
        }
        Ok(())
    }
}
