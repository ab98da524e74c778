//! Rename by copy-then-delete.
//!
//! Nothing here is atomic. A rename that fails while copying leaves the
//! copies made so far in place and every source key untouched, so running
//! the same rename again completes it.

use crate::{
    errors::{FsError, FsResult},
    keys::{marker_key, maybe_add_trailing_slash, path_to_key},
    models::{
        file_status::{FileStatus, ProbeSet, Tristate},
        path::FsPath,
    },
    services::{
        context::StoreContext,
        delete::{ensure_complete, remove_keys},
        listing::{ListingOptions, ObjectListing},
        markers::{ensure_parent_markers, remove_stale_markers},
        status::resolve,
    },
};
use futures::{StreamExt, stream};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Where a rename has got to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenameState {
    Validating,
    Copying,
    DeletingSource,
    Done,
    Failed,
}

/// One key to copy.
#[derive(Clone, Debug)]
pub struct CopyTask {
    pub source_key: String,
    pub dest_key: String,
    pub status: FileStatus,
}

/// Everything decided before the first copy.
#[derive(Clone, Debug)]
pub struct RenamePlan {
    pub source: FileStatus,
    pub destination: Option<FileStatus>,
    /// Final path of the source; differs from the requested destination
    /// when a file is moved into a directory.
    pub target: FsPath,
    pub copies: Vec<CopyTask>,
    /// Subdirectories of a renamed directory, by source path.
    pub directories: Vec<FsPath>,
}

impl RenamePlan {
    fn dest_was_empty_dir(&self) -> bool {
        self.destination
            .as_ref()
            .is_some_and(|d| d.is_directory && d.is_empty_directory == Tristate::True)
    }

    /// Whether some key strictly beneath `dir` is copied.
    fn copies_under(&self, dir: &FsPath) -> bool {
        let prefix = maybe_add_trailing_slash(&path_to_key(dir));
        self.copies
            .iter()
            .any(|task| task.source_key.len() > prefix.len() && task.source_key.starts_with(&prefix))
    }

    /// Whether any copied key, `dir`'s own marker included, keeps `dir`
    /// visible at the destination.
    fn carries(&self, dir: &FsPath) -> bool {
        let prefix = maybe_add_trailing_slash(&path_to_key(dir));
        self.copies
            .iter()
            .any(|task| task.source_key.starts_with(&prefix))
    }
}

/// A single rename, driven through [`RenameState`].
pub struct RenameOperation<'a> {
    ctx: &'a StoreContext,
    src: FsPath,
    dst: FsPath,
    state: RenameState,
    failed_during: Option<RenameState>,
}

/// Rename `src` to `dst`; returns the bytes copied.
pub async fn rename(ctx: &StoreContext, src: &FsPath, dst: &FsPath) -> FsResult<u64> {
    RenameOperation::new(ctx, src.clone(), dst.clone())
        .execute()
        .await
}

impl<'a> RenameOperation<'a> {
    pub fn new(ctx: &'a StoreContext, src: FsPath, dst: FsPath) -> Self {
        Self {
            ctx,
            src,
            dst,
            state: RenameState::Validating,
            failed_during: None,
        }
    }

    pub fn state(&self) -> RenameState {
        self.state
    }

    /// The state a failed rename was in when it failed.
    pub fn failed_during(&self) -> Option<RenameState> {
        self.failed_during
    }

    fn advance(&mut self, next: RenameState) {
        debug!(
            "rename {} to {}: {:?} -> {:?}",
            self.src, self.dst, self.state, next
        );
        self.state = next;
    }

    pub async fn execute(&mut self) -> FsResult<u64> {
        match self.run().await {
            Ok(bytes) => {
                self.advance(RenameState::Done);
                Ok(bytes)
            }
            Err(err) => {
                debug!("rename {} to {} failed: {}", self.src, self.dst, err);
                self.failed_during = Some(self.state);
                self.advance(RenameState::Failed);
                Err(err)
            }
        }
    }

    async fn run(&mut self) -> FsResult<u64> {
        self.ctx.ensure_open()?;
        let plan = self.validate().await?;

        self.advance(RenameState::Copying);
        let bytes = self.copy(&plan).await?;

        self.advance(RenameState::DeletingSource);
        self.delete_source(&plan).await?;

        info!(
            "renamed {} to {}: {} keys, {} bytes",
            self.src,
            plan.target,
            plan.copies.len(),
            bytes
        );
        Ok(bytes)
    }

    async fn validate(&self) -> FsResult<RenamePlan> {
        let (src, dst) = (&self.src, &self.dst);
        if src.is_root() {
            return Err(FsError::precondition(src, "cannot rename the root directory"));
        }
        if dst.is_root() {
            return Err(FsError::precondition(dst, "cannot rename onto the root directory"));
        }
        if src == dst {
            return Err(FsError::precondition(src, "source and destination are the same path"));
        }
        if src.is_ancestor_of(dst) {
            return Err(FsError::precondition(
                dst,
                format!("cannot rename {} into its own subdirectory", src),
            ));
        }

        let source = resolve(self.ctx, src, true, ProbeSet::ALL)
            .await?
            .ok_or_else(|| FsError::NotFound(src.clone()))?;
        let destination = resolve(self.ctx, dst, true, ProbeSet::ALL).await?;

        let target = match &destination {
            Some(existing) if source.is_directory => {
                if existing.is_file() {
                    return Err(FsError::precondition(
                        dst,
                        "cannot rename a directory onto a file",
                    ));
                }
                if existing.is_empty_directory != Tristate::True {
                    return Err(FsError::precondition(dst, "destination is a non-empty directory"));
                }
                dst.clone()
            }
            Some(existing) => {
                if existing.is_file() {
                    return Err(FsError::precondition(dst, "destination file already exists"));
                }
                let nested = dst.join(src.name());
                if resolve(self.ctx, &nested, false, ProbeSet::ALL).await?.is_some() {
                    return Err(FsError::precondition(&nested, "destination already exists"));
                }
                nested
            }
            None => {
                self.check_destination_parent().await?;
                dst.clone()
            }
        };

        let (copies, directories) = if source.is_directory {
            self.plan_tree(&target).await?
        } else {
            let copy = CopyTask {
                source_key: path_to_key(src),
                dest_key: path_to_key(&target),
                status: source.clone(),
            };
            (vec![copy], Vec::new())
        };

        Ok(RenamePlan {
            source,
            destination,
            target,
            copies,
            directories,
        })
    }

    async fn check_destination_parent(&self) -> FsResult<()> {
        let Some(parent) = self.dst.parent() else {
            return Ok(());
        };
        if parent.is_root() {
            return Ok(());
        }
        match resolve(self.ctx, &parent, false, ProbeSet::ALL).await? {
            Some(status) if status.is_directory => Ok(()),
            Some(_) => Err(FsError::precondition(
                &self.dst,
                format!("parent {} is a file", parent),
            )),
            None => Err(FsError::precondition(
                &self.dst,
                format!("parent {} does not exist", parent),
            )),
        }
    }

    /// Map every key under the source directory, its marker included, to
    /// the same place under `target`, and collect the subdirectories on the
    /// way. Directories known only to the metastore are not keys and are
    /// never copied.
    async fn plan_tree(&self, target: &FsPath) -> FsResult<(Vec<CopyTask>, Vec<FsPath>)> {
        let src_prefix = maybe_add_trailing_slash(&path_to_key(&self.src));
        let dst_prefix = maybe_add_trailing_slash(&path_to_key(target));

        let mut listing = ObjectListing::new(self.ctx.clone(), self.src.clone(), ListingOptions::TREE);
        let mut copies = Vec::new();
        let mut directories = BTreeSet::new();
        while let Some(entry) = listing.next_entry().await? {
            let Some(suffix) = entry.key.strip_prefix(src_prefix.as_str()) else {
                continue;
            };
            let path = &entry.status.path;
            if path != &self.src {
                if entry.status.is_directory {
                    directories.insert(path.clone());
                }
                directories.extend(path.ancestors().take_while(|dir| dir != &self.src));
            }
            copies.push(CopyTask {
                dest_key: format!("{}{}", dst_prefix, suffix),
                source_key: entry.key,
                status: entry.status,
            });
        }
        directories.extend(
            listing
                .known_directories()
                .iter()
                .filter(|dir| self.src.is_ancestor_of(dir))
                .cloned(),
        );
        Ok((copies, directories.into_iter().collect()))
    }

    /// Where `path`, at or beneath the source, lands under `target`.
    fn relocate(&self, path: &FsPath, target: &FsPath) -> FsPath {
        match path.as_str().strip_prefix(self.src.as_str()) {
            Some(rest) if !rest.trim_matches('/').is_empty() => target.join(rest.trim_matches('/')),
            _ => target.clone(),
        }
    }

    /// Copy every planned key. Each copy is recorded in the metastore as
    /// it completes, so a failure part way leaves the copies made so far
    /// visible.
    async fn copy(&self, plan: &RenamePlan) -> FsResult<u64> {
        let ctx = self.ctx;
        let mut copies = stream::iter(&plan.copies)
            .map(|task| async move {
                ctx.copy(&task.source_key, &task.dest_key).await?;
                Ok::<_, FsError>(task)
            })
            .buffer_unordered(ctx.executor.capacity());

        let mut bytes = 0u64;
        while let Some(result) = copies.next().await {
            let task = result?;
            debug!("copied {} to {}", task.source_key, task.dest_key);
            bytes += task.status.length;
            if let Some(metastore) = &ctx.metastore {
                let moved = self.relocate(&task.status.path, &plan.target);
                metastore.put(&task.status.with_path(moved)).await?;
            }
        }

        if !plan.source.is_directory {
            return Ok(bytes);
        }
        if let Some(metastore) = &ctx.metastore {
            let statuses = plan
                .directories
                .iter()
                .map(|dir| (self.relocate(dir, &plan.target), plan.copies_under(dir)))
                .chain(std::iter::once((plan.target.clone(), plan.copies_under(&self.src))))
                .map(|(dir, has_children)| {
                    FileStatus::directory(dir, Tristate::from_bool(!has_children), ctx.owner())
                })
                .collect::<Vec<_>>();
            metastore.put_all(&statuses).await?;
        }
        Ok(bytes)
    }

    async fn delete_source(&self, plan: &RenamePlan) -> FsResult<()> {
        let ctx = self.ctx;
        let keys = plan
            .copies
            .iter()
            .map(|task| task.source_key.clone())
            .collect::<Vec<_>>();
        if !keys.is_empty() {
            ensure_complete("rename", remove_keys(ctx, &keys, false).await?)?;
        }

        if plan.source.is_directory {
            if let Some(metastore) = &ctx.metastore {
                for dir in &plan.directories {
                    metastore.delete(dir).await?;
                }
                metastore.delete(&self.src).await?;
            }
            // directories nothing carried across get a marker of their own
            for dir in std::iter::once(&self.src).chain(&plan.directories) {
                if plan.carries(dir) {
                    continue;
                }
                if let Some(key) = marker_key(&self.relocate(dir, &plan.target)) {
                    ctx.put_marker(&key).await?;
                }
            }
            if plan.copies_under(&self.src) && plan.dest_was_empty_dir() {
                if let Some(key) = marker_key(&plan.target) {
                    if let Err(err) = remove_keys(ctx, &[key], true).await {
                        ctx.observer.on_error_ignored("remove destination marker", &err);
                    }
                }
            }
        }

        remove_stale_markers(ctx, &plan.target).await;
        ensure_parent_markers(ctx, &self.src).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::MemoryStore,
        config::FsConfig,
        metastore::{MemoryMetastore, MetadataStore},
        models::object::Encryption,
        services::testing::{self, context, context_with_metastore},
    };
    use std::sync::Arc;

    fn p(raw: &str) -> FsPath {
        FsPath::new(raw)
    }

    #[tokio::test]
    async fn same_path_is_rejected_without_store_calls() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", b"data".to_vec());
        let ctx = context(store.clone());

        let mut op = RenameOperation::new(&ctx, p("/a"), p("/a/"));
        let err = op.execute().await.unwrap_err();
        assert!(matches!(err, FsError::PreconditionFailed { .. }));
        assert_eq!(op.state(), RenameState::Failed);
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn root_is_never_renamed() {
        let ctx = context(Arc::new(MemoryStore::new()));
        for (src, dst) in [("/", "/x"), ("/x", "/")] {
            let err = rename(&ctx, &p(src), &p(dst)).await.unwrap_err();
            assert!(matches!(err, FsError::PreconditionFailed { .. }), "{src} -> {dst}");
        }
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let err = rename(&ctx, &p("/nope"), &p("/b")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn file_onto_existing_file_fails_after_two_lookups() {
        let store = Arc::new(MemoryStore::new());
        store.insert("src", b"one".to_vec());
        store.insert("dst", b"two".to_vec());
        let ctx = context(store.clone());

        let err = rename(&ctx, &p("/src"), &p("/dst")).await.unwrap_err();
        assert!(matches!(err, FsError::PreconditionFailed { .. }));
        let calls = store.calls();
        assert_eq!(calls.head, 2);
        assert_eq!(calls.total(), 2);
        assert_eq!(calls.mutations(), 0);
    }

    #[tokio::test]
    async fn directory_cannot_replace_a_file_or_full_directory() {
        let store = Arc::new(MemoryStore::new());
        store.insert("d/x", b"1".to_vec());
        store.insert("f", b"1".to_vec());
        store.insert("full/y", b"1".to_vec());
        let ctx = context(store.clone());

        for dst in ["/f", "/full"] {
            let err = rename(&ctx, &p("/d"), &p(dst)).await.unwrap_err();
            assert!(matches!(err, FsError::PreconditionFailed { .. }), "{dst}");
        }
        assert_eq!(store.calls().mutations(), 0);
    }

    #[tokio::test]
    async fn directory_cannot_move_into_itself() {
        let store = Arc::new(MemoryStore::new());
        store.insert("d/x", b"1".to_vec());
        let ctx = context(store.clone());

        let err = rename(&ctx, &p("/d"), &p("/d/inner")).await.unwrap_err();
        assert!(matches!(err, FsError::PreconditionFailed { .. }));
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn destination_parent_must_be_a_directory() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", b"1".to_vec());
        store.insert("file", b"1".to_vec());
        let ctx = context(store.clone());

        for dst in ["/missing/b", "/file/b"] {
            let err = rename(&ctx, &p("/a"), &p(dst)).await.unwrap_err();
            assert!(matches!(err, FsError::PreconditionFailed { .. }), "{dst}");
        }
        assert!(store.contains("a"));
    }

    #[tokio::test]
    async fn file_moves_into_an_existing_directory() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", b"hello".to_vec());
        store.insert("dir/", Vec::new());
        let ctx = context(store.clone());

        let bytes = rename(&ctx, &p("/a"), &p("/dir")).await.unwrap();
        assert_eq!(bytes, 5);
        assert_eq!(store.keys(), vec!["dir/a".to_string()]);
    }

    #[tokio::test]
    async fn directory_tree_moves_and_source_parent_survives() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a/src/x", b"12".to_vec());
        store.insert("a/src/sub/y", b"345".to_vec());
        let ctx = context(store.clone());

        let mut op = RenameOperation::new(&ctx, p("/a/src"), p("/moved"));
        let bytes = op.execute().await.unwrap();
        assert_eq!(bytes, 5);
        assert_eq!(op.state(), RenameState::Done);
        assert_eq!(
            store.keys(),
            vec!["a/".to_string(), "moved/sub/y".to_string(), "moved/x".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_copy_leaves_copies_and_sources_in_place() {
        let store = Arc::new(MemoryStore::new());
        for i in 1..=5 {
            store.insert(&format!("src/f{i}"), b"x".to_vec());
        }
        store.fail_copy_at(3);
        let config = FsConfig {
            max_concurrency: 1,
            ..testing::config()
        };
        let ctx = StoreContext::new(store.clone(), None, config);

        let mut op = RenameOperation::new(&ctx, p("/src"), p("/dst"));
        let err = op.execute().await.unwrap_err();
        assert!(matches!(err, FsError::AccessDenied { .. }));
        assert_eq!(op.state(), RenameState::Failed);

        let keys = store.keys();
        assert_eq!(keys.iter().filter(|k| k.starts_with("dst/")).count(), 2);
        assert_eq!(keys.iter().filter(|k| k.starts_with("src/")).count(), 5);
        assert_eq!(store.calls().delete_many + store.calls().delete_one, 0);
    }

    #[tokio::test]
    async fn empty_directory_keeps_its_marker() {
        let store = Arc::new(MemoryStore::new());
        store.insert("e/", Vec::new());
        let ctx = context(store.clone());

        rename(&ctx, &p("/e"), &p("/f")).await.unwrap();
        assert_eq!(store.keys(), vec!["f/".to_string()]);
    }

    #[tokio::test]
    async fn directory_merges_into_an_empty_directory() {
        let store = Arc::new(MemoryStore::new());
        store.insert("s/a", b"1".to_vec());
        store.insert("t/", Vec::new());
        let ctx = context(store.clone());

        rename(&ctx, &p("/s"), &p("/t")).await.unwrap();
        assert_eq!(store.keys(), vec!["t/a".to_string()]);
    }

    #[tokio::test]
    async fn metastore_follows_the_move() {
        let store = Arc::new(MemoryStore::new());
        store.insert("d/a", b"1".to_vec());
        let meta = Arc::new(MemoryMetastore::new("tester"));
        let ctx = context_with_metastore(store.clone(), meta.clone());

        rename(&ctx, &p("/d"), &p("/e")).await.unwrap();
        assert!(meta.get(&p("/d")).await.unwrap().unwrap().is_deleted);
        assert!(meta.get(&p("/d/a")).await.unwrap().unwrap().is_deleted);
        let moved = meta.get(&p("/e/a")).await.unwrap().unwrap();
        assert!(!moved.is_deleted);
        assert_eq!(moved.status.length, 1);
        let dir = meta.get(&p("/e")).await.unwrap().unwrap();
        assert!(dir.status.is_directory);
        assert_eq!(dir.status.is_empty_directory, Tristate::False);
    }

    #[tokio::test]
    async fn nested_directories_move_when_only_the_metastore_records_them() {
        let store = Arc::new(MemoryStore::new());
        store.insert("src/sub/f", b"abc".to_vec());
        let meta = Arc::new(MemoryMetastore::new("tester"));
        meta.put_all(&[
            FileStatus::directory(p("/src"), Tristate::False, "tester"),
            FileStatus::directory(p("/src/sub"), Tristate::False, "tester"),
            FileStatus::file(p("/src/sub/f"), 3, chrono::Utc::now(), 0, "tester", None, None),
        ])
        .await
        .unwrap();
        let ctx = context_with_metastore(store.clone(), meta.clone());

        let mut op = RenameOperation::new(&ctx, p("/src"), p("/dst"));
        assert_eq!(op.execute().await.unwrap(), 3);
        assert_eq!(store.keys(), vec!["dst/sub/f".to_string()]);
        assert_eq!(store.calls().copy, 1);

        let sub = meta.get(&p("/dst/sub")).await.unwrap().unwrap();
        assert!(sub.status.is_directory);
        assert_eq!(sub.status.is_empty_directory, Tristate::False);
        assert!(!meta.get(&p("/dst/sub/f")).await.unwrap().unwrap().is_deleted);
        for gone in ["/src", "/src/sub", "/src/sub/f"] {
            assert!(meta.get(&p(gone)).await.unwrap().unwrap().is_deleted, "{gone}");
        }
    }

    #[tokio::test]
    async fn directory_known_only_to_the_metastore_gets_a_marker() {
        let store = Arc::new(MemoryStore::new());
        store.insert("src/a", b"1".to_vec());
        let meta = Arc::new(MemoryMetastore::new("tester"));
        meta.put(&FileStatus::directory(p("/src/empty"), Tristate::True, "tester"))
            .await
            .unwrap();
        let ctx = context_with_metastore(store.clone(), meta.clone());

        rename(&ctx, &p("/src"), &p("/dst")).await.unwrap();
        assert_eq!(
            store.keys(),
            vec!["dst/a".to_string(), "dst/empty/".to_string()]
        );
        let empty = meta.get(&p("/dst/empty")).await.unwrap().unwrap();
        assert_eq!(empty.status.is_empty_directory, Tristate::True);
    }

    #[tokio::test]
    async fn failed_copy_still_records_finished_copies() {
        let store = Arc::new(MemoryStore::new());
        for i in 1..=5 {
            store.insert(&format!("src/f{i}"), b"x".to_vec());
        }
        store.fail_copy_at(3);
        let meta = Arc::new(MemoryMetastore::new("tester"));
        let config = FsConfig {
            max_concurrency: 1,
            ..testing::config()
        };
        let ctx = StoreContext::new(
            store.clone(),
            Some(meta.clone() as Arc<dyn MetadataStore>),
            config,
        );

        let mut op = RenameOperation::new(&ctx, p("/src"), p("/dst"));
        assert!(op.execute().await.is_err());
        assert_eq!(op.failed_during(), Some(RenameState::Copying));
        for copied in ["/dst/f1", "/dst/f2"] {
            let entry = meta.get(&p(copied)).await.unwrap().unwrap();
            assert!(!entry.is_deleted, "{copied}");
        }
        assert!(meta.get(&p("/dst/f3")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_source_fails_while_validating() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let mut op = RenameOperation::new(&ctx, p("/nope"), p("/b"));
        assert!(op.execute().await.unwrap_err().is_not_found());
        assert_eq!(op.failed_during(), Some(RenameState::Validating));
    }

    #[tokio::test]
    async fn copies_take_the_configured_encryption() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", b"secret".to_vec());
        let config = FsConfig {
            encryption: Encryption::SseS3,
            ..testing::config()
        };
        let ctx = StoreContext::new(store.clone(), None, config);

        rename(&ctx, &p("/a"), &p("/b")).await.unwrap();
        assert_eq!(store.encryption_of("b"), Some(Encryption::SseS3));
    }
}
