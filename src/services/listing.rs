//! Directory listings merged from the store and the metastore.
//!
//! A listing is lazy: pages are fetched as entries are consumed. Entries
//! the metastore knows come first, store pages follow in key order, and a
//! key is yielded once. Tombstoned paths never appear unless the caller
//! asks for every key (recursive delete does, so stale keys get deleted
//! again).

use crate::{
    config::ListingVersion,
    errors::FsResult,
    keys::{key_to_path, marker_key, maybe_add_trailing_slash, object_represents_directory, path_to_key},
    models::{
        file_status::{FileStatus, Tristate},
        object::{ListContinuation, ListRequest, ObjectSummary},
        path::FsPath,
    },
    services::context::StoreContext,
};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// What a listing yields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListingOptions {
    /// Walk the whole subtree instead of the immediate children.
    pub recursive: bool,
    /// Yield directory markers, the listed directory's own included.
    pub include_markers: bool,
    /// Hide tombstoned paths.
    pub filter_tombstones: bool,
}

impl ListingOptions {
    /// Immediate children: files and subdirectories.
    pub const CHILDREN: ListingOptions = ListingOptions {
        recursive: false,
        include_markers: false,
        filter_tombstones: true,
    };

    /// Every file in the subtree.
    pub const FILES: ListingOptions = ListingOptions {
        recursive: true,
        include_markers: false,
        filter_tombstones: true,
    };

    /// Every live key in the subtree, markers included.
    pub const TREE: ListingOptions = ListingOptions {
        recursive: true,
        include_markers: true,
        filter_tombstones: true,
    };

    /// Every key in the subtree, whatever the metastore says about it.
    pub const ALL_KEYS: ListingOptions = ListingOptions {
        recursive: true,
        include_markers: true,
        filter_tombstones: false,
    };
}

/// One listed object or directory, with the key it lives under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListingEntry {
    pub key: String,
    pub status: FileStatus,
}

#[derive(Default)]
struct ListingState {
    started: bool,
    store_exhausted: bool,
    finished: bool,
    continuation: Option<ListContinuation>,
    buffer: VecDeque<ListingEntry>,
    tombstones: HashSet<FsPath>,
    emitted: HashSet<String>,
    discovered: Vec<FileStatus>,
    directories: Vec<FsPath>,
    pages: usize,
}

/// A lazy, restartable listing of one directory.
pub struct ObjectListing {
    ctx: StoreContext,
    path: FsPath,
    dir_key: String,
    options: ListingOptions,
    state: ListingState,
}

/// Statuses under `path`: its immediate children, or every file beneath it
/// when `recursive`.
pub fn list_children(ctx: &StoreContext, path: &FsPath, recursive: bool) -> ObjectListing {
    let options = if recursive {
        ListingOptions::FILES
    } else {
        ListingOptions::CHILDREN
    };
    ObjectListing::new(ctx.clone(), path.clone(), options)
}

impl ObjectListing {
    pub fn new(ctx: StoreContext, path: FsPath, options: ListingOptions) -> Self {
        let dir_key = maybe_add_trailing_slash(&path_to_key(&path));
        Self {
            ctx,
            path,
            dir_key,
            options,
            state: ListingState::default(),
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Subdirectories the metastore knows about, gathered while walking a
    /// recursive listing. They may have no object of their own in the store.
    pub fn known_directories(&self) -> &[FsPath] {
        &self.state.directories
    }

    /// Store pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.state.pages
    }

    /// Start over from the first entry.
    pub fn restart(&mut self) {
        self.state = ListingState::default();
    }

    pub async fn next(&mut self) -> FsResult<Option<FileStatus>> {
        Ok(self.next_entry().await?.map(|entry| entry.status))
    }

    pub async fn next_entry(&mut self) -> FsResult<Option<ListingEntry>> {
        self.ctx.ensure_open()?;
        loop {
            if let Some(entry) = self.state.buffer.pop_front() {
                return Ok(Some(entry));
            }
            if !self.state.started {
                self.state.started = true;
                self.load_metastore().await?;
                continue;
            }
            if self.state.store_exhausted {
                self.finish().await?;
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    pub async fn collect_entries(mut self) -> FsResult<Vec<ListingEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub async fn collect_statuses(mut self) -> FsResult<Vec<FileStatus>> {
        let mut statuses = Vec::new();
        while let Some(status) = self.next().await? {
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Queue what the metastore knows about the directory (the whole
    /// subtree when recursive) and collect its tombstones. When every
    /// directory visited is authoritative the store is skipped, unless
    /// markers are wanted: only the store knows which markers exist.
    ///
    /// A recursive walk yields only keys, so the metastore's directories
    /// are descended into but not queued.
    async fn load_metastore(&mut self) -> FsResult<()> {
        let Some(metastore) = self.ctx.metastore.clone() else {
            return Ok(());
        };

        let mut all_authoritative = self.options.filter_tombstones && !self.options.include_markers;
        let mut pending = VecDeque::from([self.path.clone()]);
        while let Some(dir) = pending.pop_front() {
            let Some(listing) = metastore.list_children(&dir).await? else {
                all_authoritative = false;
                continue;
            };
            if !(listing.is_authoritative && self.ctx.allow_authoritative(&dir)) {
                all_authoritative = false;
            }
            for entry in listing.entries {
                if entry.is_deleted {
                    self.state.tombstones.insert(entry.path().clone());
                    continue;
                }
                let status = entry.status;
                if status.is_directory {
                    if self.options.recursive {
                        pending.push_back(status.path.clone());
                        self.state.directories.push(status.path);
                        continue;
                    }
                    if let Some(key) = marker_key(&status.path) {
                        self.accept(ListingEntry { key, status }, false);
                    }
                } else {
                    let key = path_to_key(&status.path);
                    self.accept(ListingEntry { key, status }, false);
                }
            }
        }

        if all_authoritative {
            debug!("listing of {} served from the metastore", self.path);
            self.state.store_exhausted = true;
            self.state.finished = true;
        }
        Ok(())
    }

    async fn fetch_page(&mut self) -> FsResult<()> {
        let request = ListRequest {
            prefix: self.dir_key.clone(),
            delimiter: (!self.options.recursive).then(|| "/".to_string()),
            max_keys: self.ctx.config.list_page_size,
            continuation: self.state.continuation.take(),
        };
        let page = self.ctx.list(&self.path, &request).await?;
        self.state.pages += 1;
        debug!(
            "listing page {} of {}: {} objects, {} prefixes",
            self.state.pages,
            self.path,
            page.objects.len(),
            page.common_prefixes.len()
        );

        for summary in page.objects {
            if let Some(entry) = self.object_entry(summary) {
                self.accept(entry, true);
            }
        }
        for prefix in page.common_prefixes {
            let status = FileStatus::directory(key_to_path(&prefix), Tristate::Unknown, self.ctx.owner());
            self.accept(ListingEntry { key: prefix, status }, true);
        }

        self.state.continuation = match self.ctx.config.listing_version {
            ListingVersion::V1 => page.next_marker.map(ListContinuation::Marker),
            ListingVersion::V2 => page.next_token.map(ListContinuation::Token),
        };
        if !page.is_truncated || self.state.continuation.is_none() {
            self.state.store_exhausted = true;
        }
        Ok(())
    }

    fn object_entry(&self, summary: ObjectSummary) -> Option<ListingEntry> {
        let is_marker = object_represents_directory(&summary.key, summary.size);
        if (is_marker || summary.key == self.dir_key) && !self.options.include_markers {
            return None;
        }
        let path = key_to_path(&summary.key);
        let status = if is_marker {
            FileStatus::directory(path, Tristate::Unknown, self.ctx.owner())
        } else {
            FileStatus::file(
                path,
                summary.size,
                summary.last_modified,
                self.ctx.config.block_size,
                self.ctx.owner(),
                summary.etag,
                None,
            )
        };
        Some(ListingEntry {
            key: summary.key,
            status,
        })
    }

    fn is_tombstoned(&self, path: &FsPath) -> bool {
        if self.state.tombstones.is_empty() {
            return false;
        }
        std::iter::once(path.clone())
            .chain(path.ancestors())
            .take_while(|p| p != &self.path)
            .any(|p| self.state.tombstones.contains(&p))
    }

    fn accept(&mut self, entry: ListingEntry, from_store: bool) {
        if self.options.filter_tombstones && self.is_tombstoned(&entry.status.path) {
            debug!("skipping tombstoned {}", entry.key);
            return;
        }
        if !self.state.emitted.insert(entry.key.clone()) {
            return;
        }
        if from_store && self.writes_back() {
            self.state.discovered.push(entry.status.clone());
        }
        self.state.buffer.push_back(entry);
    }

    fn writes_back(&self) -> bool {
        self.ctx.metastore.is_some() && self.options == ListingOptions::CHILDREN
    }

    /// Record what the store listed and, for authoritative paths, declare
    /// the metastore's listing complete.
    async fn finish(&mut self) -> FsResult<()> {
        if self.state.finished {
            return Ok(());
        }
        self.state.finished = true;
        let Some(metastore) = &self.ctx.metastore else {
            return Ok(());
        };
        if !self.writes_back() {
            return Ok(());
        }

        let discovered = std::mem::take(&mut self.state.discovered);
        metastore.put_all(&discovered).await?;
        if self.ctx.allow_authoritative(&self.path) {
            debug!("marking listing of {} authoritative", self.path);
            metastore.set_authoritative(&self.path, true).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::MemoryStore,
        config::FsConfig,
        metastore::{MemoryMetastore, MetadataStore},
        services::testing::{self, context, context_with_metastore},
    };
    use std::sync::Arc;

    fn names(statuses: &[FileStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.path.to_string()).collect()
    }

    fn populated() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for key in ["d/", "d/a", "d/b", "d/c", "d/sub/", "d/sub/x", "d/sub/y/z", "e"] {
            store.insert(key, if key.ends_with('/') { Vec::new() } else { b"1".to_vec() });
        }
        store
    }

    fn paged(version: ListingVersion) -> FsConfig {
        FsConfig {
            list_page_size: 2,
            listing_version: version,
            ..testing::config()
        }
    }

    #[tokio::test]
    async fn children_are_files_and_subdirectories() {
        let ctx = context(populated());
        let statuses = list_children(&ctx, &FsPath::new("/d"), false)
            .collect_statuses()
            .await
            .unwrap();
        assert_eq!(names(&statuses), vec!["/d/a", "/d/b", "/d/c", "/d/sub"]);
        assert!(statuses[3].is_directory);
    }

    #[tokio::test]
    async fn both_listing_versions_page_through_everything() {
        for version in [ListingVersion::V1, ListingVersion::V2] {
            let store = populated();
            let ctx = StoreContext::new(store.clone(), None, paged(version));
            let mut listing = list_children(&ctx, &FsPath::new("/d"), false);
            let mut seen = Vec::new();
            while let Some(status) = listing.next().await.unwrap() {
                seen.push(status.path.to_string());
            }
            assert_eq!(seen, vec!["/d/a", "/d/b", "/d/c", "/d/sub"], "{version:?}");
            assert_eq!(listing.pages_fetched(), 3, "{version:?}");
        }
    }

    #[tokio::test]
    async fn recursive_listing_yields_files_only() {
        let ctx = StoreContext::new(populated(), None, paged(ListingVersion::V2));
        let statuses = list_children(&ctx, &FsPath::new("/d"), true)
            .collect_statuses()
            .await
            .unwrap();
        assert_eq!(
            names(&statuses),
            vec!["/d/a", "/d/b", "/d/c", "/d/sub/x", "/d/sub/y/z"]
        );
    }

    #[tokio::test]
    async fn all_keys_includes_markers() {
        let ctx = context(populated());
        let keys = ObjectListing::new(ctx, FsPath::new("/d"), ListingOptions::ALL_KEYS)
            .collect_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec!["d/", "d/a", "d/b", "d/c", "d/sub/", "d/sub/x", "d/sub/y/z"]
        );
    }

    #[tokio::test]
    async fn listing_can_restart() {
        let ctx = StoreContext::new(populated(), None, paged(ListingVersion::V2));
        let mut listing = list_children(&ctx, &FsPath::new("/d"), false);
        assert_eq!(listing.next().await.unwrap().unwrap().path, FsPath::new("/d/a"));
        assert_eq!(listing.next().await.unwrap().unwrap().path, FsPath::new("/d/b"));
        listing.restart();
        assert_eq!(listing.next().await.unwrap().unwrap().path, FsPath::new("/d/a"));
    }

    #[tokio::test]
    async fn metastore_entries_come_first_and_once() {
        let store = populated();
        let meta = Arc::new(MemoryMetastore::new("tester"));
        let fresh = FileStatus::file(FsPath::new("/d/new"), 1, chrono::Utc::now(), 0, "tester", None, None);
        let known = FileStatus::file(FsPath::new("/d/b"), 1, chrono::Utc::now(), 0, "tester", None, None);
        meta.put_all(&[fresh, known]).await.unwrap();
        let ctx = context_with_metastore(store, meta);

        let statuses = list_children(&ctx, &FsPath::new("/d"), false)
            .collect_statuses()
            .await
            .unwrap();
        assert_eq!(
            names(&statuses),
            vec!["/d/b", "/d/new", "/d/a", "/d/c", "/d/sub"]
        );
    }

    #[tokio::test]
    async fn tombstoned_directories_hide_their_contents() {
        let store = populated();
        let meta = Arc::new(MemoryMetastore::new("tester"));
        meta.delete(&FsPath::new("/d/sub")).await.unwrap();
        let ctx = context_with_metastore(store, meta);

        let statuses = list_children(&ctx, &FsPath::new("/d"), true)
            .collect_statuses()
            .await
            .unwrap();
        assert_eq!(names(&statuses), vec!["/d/a", "/d/b", "/d/c"]);
    }

    #[tokio::test]
    async fn authoritative_listing_skips_the_store() {
        let store = populated();
        let meta = Arc::new(MemoryMetastore::new("tester"));
        let config = FsConfig {
            authoritative: true,
            ..testing::config()
        };
        let ctx = StoreContext::new(store.clone(), Some(meta.clone() as Arc<dyn MetadataStore>), config);

        // the first listing goes to the store and records the result
        let first = list_children(&ctx, &FsPath::new("/d"), false)
            .collect_statuses()
            .await
            .unwrap();
        assert_eq!(store.calls().list, 1);
        assert!(meta.list_children(&FsPath::new("/d")).await.unwrap().unwrap().is_authoritative);

        // the second is served by the metastore alone
        store.reset_calls();
        let second = list_children(&ctx, &FsPath::new("/d"), false)
            .collect_statuses()
            .await
            .unwrap();
        assert_eq!(store.calls().list, 0);
        let mut first = names(&first);
        let mut second = names(&second);
        first.sort();
        second.sort();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn non_authoritative_listing_always_asks_the_store() {
        let store = populated();
        let meta = Arc::new(MemoryMetastore::new("tester"));
        let ctx = context_with_metastore(store.clone(), meta.clone());

        for _ in 0..2 {
            list_children(&ctx, &FsPath::new("/d"), false)
                .collect_statuses()
                .await
                .unwrap();
        }
        assert_eq!(store.calls().list, 2);
        assert!(!meta.list_children(&FsPath::new("/d")).await.unwrap().unwrap().is_authoritative);
    }

    #[tokio::test]
    async fn root_listing_uses_the_empty_prefix() {
        let ctx = context(populated());
        let statuses = list_children(&ctx, &FsPath::root(), false)
            .collect_statuses()
            .await
            .unwrap();
        assert_eq!(names(&statuses), vec!["/e", "/d"]);
    }

    #[tokio::test]
    async fn recursive_listing_walks_but_never_yields_metastore_directories() {
        let store = Arc::new(MemoryStore::new());
        store.insert("d/sub/f", b"1".to_vec());
        let meta = Arc::new(MemoryMetastore::new("tester"));
        meta.put_all(&[
            FileStatus::directory(FsPath::new("/d/sub"), Tristate::False, "tester"),
            FileStatus::file(FsPath::new("/d/sub/f"), 1, chrono::Utc::now(), 0, "tester", None, None),
        ])
        .await
        .unwrap();
        let ctx = context_with_metastore(store, meta);

        let mut listing = ObjectListing::new(ctx, FsPath::new("/d"), ListingOptions::TREE);
        let mut keys = Vec::new();
        while let Some(entry) = listing.next_entry().await.unwrap() {
            keys.push(entry.key);
        }
        assert_eq!(keys, vec!["d/sub/f"]);
        assert_eq!(listing.known_directories(), &[FsPath::new("/d/sub")]);
    }
}
