//! The filesystem facade.

use crate::{
    backends::ObjectStore,
    config::FsConfig,
    errors::{FsError, FsResult},
    keys::{marker_key, path_to_key},
    metastore::MetadataStore,
    models::{
        file_status::{FileStatus, ProbeSet, Tristate},
        object::PutResult,
        path::FsPath,
    },
    services::{
        context::StoreContext,
        delete,
        listing::list_children,
        markers::remove_stale_markers,
        rename::{RenameOperation, RenameState},
        status::resolve,
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::{path::Path, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// A hierarchical filesystem over one object store.
///
/// Cheap to clone; clones share the store, the metastore and the request
/// executor, so closing one closes all of them.
#[derive(Clone)]
pub struct ObjectFileSystem {
    ctx: StoreContext,
}

impl ObjectFileSystem {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metastore: Option<Arc<dyn MetadataStore>>,
        config: FsConfig,
    ) -> Self {
        info!(
            "filesystem initialized: metastore={}, listing={:?}, concurrency={}",
            metastore.is_some(),
            config.listing_version,
            config.max_concurrency
        );
        Self::with_context(StoreContext::new(store, metastore, config))
    }

    pub fn with_context(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    pub fn config(&self) -> &FsConfig {
        &self.ctx.config
    }

    /// Status of `path`, `NotFound` when nothing is there.
    pub async fn get_file_status(&self, path: &FsPath) -> FsResult<FileStatus> {
        resolve(&self.ctx, path, true, ProbeSet::ALL)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))
    }

    pub async fn exists(&self, path: &FsPath) -> FsResult<bool> {
        Ok(self.lookup(path).await?.is_some())
    }

    pub async fn is_file(&self, path: &FsPath) -> FsResult<bool> {
        Ok(self.lookup(path).await?.is_some_and(|s| s.is_file()))
    }

    pub async fn is_directory(&self, path: &FsPath) -> FsResult<bool> {
        Ok(self.lookup(path).await?.is_some_and(|s| s.is_directory))
    }

    async fn lookup(&self, path: &FsPath) -> FsResult<Option<FileStatus>> {
        resolve(&self.ctx, path, false, ProbeSet::ALL).await
    }

    /// Create `path` and any missing parents. Returns `true` when the
    /// directory exists afterwards; a file anywhere on the way fails.
    pub async fn mkdirs(&self, path: &FsPath) -> FsResult<bool> {
        debug!("Making directory: {}", path);
        if let Some(status) = self.lookup(path).await? {
            if status.is_directory {
                return Ok(true);
            }
            return Err(FsError::already_exists(path, "path is a file"));
        }

        let mut ancestor = path.parent();
        while let Some(dir) = ancestor {
            if dir.is_root() {
                break;
            }
            match self.lookup(&dir).await? {
                Some(status) if status.is_directory => break,
                Some(_) => {
                    return Err(FsError::already_exists(
                        &dir,
                        format!("cannot create directory {} under a file", path),
                    ));
                }
                None => ancestor = dir.parent(),
            }
        }

        let Some(key) = marker_key(path) else {
            return Ok(true);
        };
        self.ctx.put_marker(&key).await?;
        remove_stale_markers(&self.ctx, path).await;

        if let Some(metastore) = &self.ctx.metastore {
            self.record_ancestors(path).await?;
            metastore
                .put(&FileStatus::directory(path.clone(), Tristate::True, self.ctx.owner()))
                .await?;
        }
        Ok(true)
    }

    async fn check_create(&self, path: &FsPath, overwrite: bool) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::already_exists(path, "the root is a directory"));
        }
        // an overwrite only needs to know there is no directory in the way
        let probes = if overwrite {
            ProbeSet::DIRECTORIES
        } else {
            ProbeSet::ALL
        };
        match resolve(&self.ctx, path, false, probes).await? {
            Some(status) if status.is_directory => {
                Err(FsError::already_exists(path, "path is a directory"))
            }
            Some(_) if !overwrite => Err(FsError::already_exists(path, "file exists")),
            _ => Ok(()),
        }
    }

    /// Write `data` to the file at `path`.
    pub async fn create(
        &self,
        path: &FsPath,
        data: impl Into<Bytes>,
        overwrite: bool,
    ) -> FsResult<FileStatus> {
        self.check_create(path, overwrite).await?;
        let result = self.ctx.put_object(path, data.into()).await?;
        self.finished_write(path, result).await
    }

    /// Upload the local file `source` to `path`, streaming its contents.
    pub async fn copy_from_local_file(
        &self,
        source: &Path,
        path: &FsPath,
        overwrite: bool,
    ) -> FsResult<FileStatus> {
        self.check_create(path, overwrite).await?;
        let file = tokio::fs::File::open(source).await?;
        debug!("uploading {} to {}", source.display(), path);
        let result = self
            .ctx
            .put_stream(path, ReaderStream::new(file).boxed())
            .await?;
        self.finished_write(path, result).await
    }

    /// Bookkeeping after a successful PUT: parent markers are no longer
    /// needed and the metastore learns about the file and its parents.
    async fn finished_write(&self, path: &FsPath, result: PutResult) -> FsResult<FileStatus> {
        remove_stale_markers(&self.ctx, path).await;
        let status = FileStatus::file(
            path.clone(),
            result.size,
            Utc::now(),
            self.ctx.config.block_size,
            self.ctx.owner(),
            result.etag,
            result.version_id,
        );
        if let Some(metastore) = &self.ctx.metastore {
            self.record_ancestors(path).await?;
            metastore.put(&status).await?;
        }
        Ok(status)
    }

    async fn record_ancestors(&self, path: &FsPath) -> FsResult<()> {
        let Some(metastore) = &self.ctx.metastore else {
            return Ok(());
        };
        let ancestors = path
            .ancestors()
            .filter(|p| !p.is_root())
            .map(|p| FileStatus::directory(p, Tristate::False, self.ctx.owner()))
            .collect::<Vec<_>>();
        metastore.put_all(&ancestors).await?;
        Ok(())
    }

    /// Full contents of the file at `path`.
    pub async fn open(&self, path: &FsPath) -> FsResult<Bytes> {
        let status = resolve(&self.ctx, path, false, ProbeSet::ALL)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if status.is_directory {
            return Err(FsError::IsDirectory(path.clone()));
        }
        self.ctx.get(path).await
    }

    pub async fn delete(&self, path: &FsPath, recursive: bool) -> FsResult<bool> {
        delete::delete(&self.ctx, path, recursive).await
    }

    /// Rename `src` to `dst`. A missing source is `Ok(false)`; structural
    /// conflicts are errors, as is a key vanishing once copying started.
    pub async fn rename(&self, src: &FsPath, dst: &FsPath) -> FsResult<bool> {
        let mut operation = RenameOperation::new(&self.ctx, src.clone(), dst.clone());
        match operation.execute().await {
            Ok(_) => Ok(true),
            Err(err)
                if err.is_not_found()
                    && operation.failed_during() == Some(RenameState::Validating) =>
            {
                debug!("rename: source {} does not exist", src);
                self.ctx.observer.on_error_ignored("rename", &err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Immediate children of a directory, or the file itself.
    pub async fn list_status(&self, path: &FsPath) -> FsResult<Vec<FileStatus>> {
        let status = resolve(&self.ctx, path, false, ProbeSet::ALL)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if status.is_file() {
            return Ok(vec![status]);
        }
        list_children(&self.ctx, path, false)
            .collect_statuses()
            .await
    }

    /// Files under `path`, the whole subtree when `recursive`.
    pub async fn list_files(&self, path: &FsPath, recursive: bool) -> FsResult<Vec<FileStatus>> {
        let status = resolve(&self.ctx, path, false, ProbeSet::ALL)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if status.is_file() {
            return Ok(vec![status]);
        }
        let statuses = list_children(&self.ctx, path, recursive)
            .collect_statuses()
            .await?;
        Ok(statuses.into_iter().filter(FileStatus::is_file).collect())
    }

    /// The object's etag, when etags are exposed as checksums.
    pub async fn get_file_checksum(&self, path: &FsPath) -> FsResult<Option<String>> {
        if !self.ctx.config.etag_checksum_enabled {
            return Ok(None);
        }
        let meta = self.ctx.head(&path_to_key(path)).await?;
        Ok(meta.etag)
    }

    /// Abort requests in flight. The filesystem stays usable.
    pub fn interrupt(&self) {
        self.ctx.executor.interrupt();
    }

    /// Abort requests in flight and refuse any more.
    pub fn close(&self) {
        if !self.ctx.executor.is_closed() {
            info!("closing filesystem");
        }
        self.ctx.executor.close();
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.executor.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::MemoryStore,
        metastore::MemoryMetastore,
        services::testing,
    };
    use std::io::Write;

    fn p(raw: &str) -> FsPath {
        FsPath::new(raw)
    }

    fn fs(store: &Arc<MemoryStore>) -> ObjectFileSystem {
        ObjectFileSystem::with_context(testing::context(store.clone()))
    }

    #[tokio::test]
    async fn mkdirs_writes_one_marker() {
        let store = Arc::new(MemoryStore::new());
        let fs = fs(&store);

        assert!(fs.mkdirs(&p("/a/b/c")).await.unwrap());
        assert_eq!(store.keys(), vec!["a/b/c/".to_string()]);
        assert!(fs.is_directory(&p("/a/b")).await.unwrap());
        assert!(fs.mkdirs(&p("/a/b/c")).await.unwrap());
        assert_eq!(store.calls().put, 1);
    }

    #[tokio::test]
    async fn mkdirs_under_a_file_fails() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", b"x".to_vec());
        let fs = fs(&store);

        for path in ["/a", "/a/b/c"] {
            let err = fs.mkdirs(&p(path)).await.unwrap_err();
            assert!(matches!(err, FsError::AlreadyExists { .. }), "{path}");
        }
        assert_eq!(store.calls().put, 0);
    }

    #[tokio::test]
    async fn create_replaces_the_parent_marker() {
        let store = Arc::new(MemoryStore::new());
        let fs = fs(&store);
        fs.mkdirs(&p("/dir")).await.unwrap();

        let status = fs.create(&p("/dir/file"), "hello", false).await.unwrap();
        assert_eq!(status.length, 5);
        assert_eq!(store.keys(), vec!["dir/file".to_string()]);
        assert_eq!(fs.open(&p("/dir/file")).await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn create_refuses_directories_and_existing_files() {
        let store = Arc::new(MemoryStore::new());
        store.insert("dir/", Vec::new());
        store.insert("file", b"x".to_vec());
        let fs = fs(&store);

        for overwrite in [false, true] {
            let err = fs.create(&p("/dir"), "x", overwrite).await.unwrap_err();
            assert!(matches!(err, FsError::AlreadyExists { .. }));
        }
        let err = fs.create(&p("/file"), "x", false).await.unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn overwrite_only_probes_for_directories() {
        let store = Arc::new(MemoryStore::new());
        store.insert("file", b"old".to_vec());
        let fs = fs(&store);

        fs.create(&p("/file"), "new", true).await.unwrap();
        let calls = store.calls();
        assert_eq!(calls.head, 1);
        assert_eq!(calls.list, 1);
        assert_eq!(fs.open(&p("/file")).await.unwrap(), Bytes::from("new"));
    }

    #[tokio::test]
    async fn local_files_are_streamed_up() {
        let store = Arc::new(MemoryStore::new());
        let fs = fs(&store);
        let mut local = tempfile::NamedTempFile::new().unwrap();
        local.write_all(b"from disk").unwrap();

        let status = fs
            .copy_from_local_file(local.path(), &p("/up/loaded"), false)
            .await
            .unwrap();
        assert_eq!(status.length, 9);
        assert_eq!(fs.open(&p("/up/loaded")).await.unwrap(), Bytes::from("from disk"));
    }

    #[tokio::test]
    async fn opening_a_directory_fails() {
        let store = Arc::new(MemoryStore::new());
        store.insert("d/x", b"1".to_vec());
        let fs = fs(&store);

        assert!(matches!(
            fs.open(&p("/d")).await.unwrap_err(),
            FsError::IsDirectory(_)
        ));
        assert!(fs.open(&p("/nope")).await.unwrap_err().is_not_found());
        assert!(fs.get_file_status(&p("/nope")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rename_of_missing_source_is_false() {
        let store = Arc::new(MemoryStore::new());
        let fs = fs(&store);
        assert!(!fs.rename(&p("/a"), &p("/b")).await.unwrap());
    }

    #[tokio::test]
    async fn list_status_of_a_file_is_the_file() {
        let store = Arc::new(MemoryStore::new());
        store.insert("d/f", b"1".to_vec());
        store.insert("d/sub/g", b"1".to_vec());
        let fs = fs(&store);

        let listed = fs.list_status(&p("/d/f")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_file());

        let children = fs.list_status(&p("/d")).await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(fs.list_files(&p("/d"), false).await.unwrap().len(), 1);
        assert_eq!(fs.list_files(&p("/d"), true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn checksums_follow_configuration() {
        let store = Arc::new(MemoryStore::new());
        store.insert("f", b"abc".to_vec());

        let plain = fs(&store);
        assert_eq!(plain.get_file_checksum(&p("/f")).await.unwrap(), None);

        let config = FsConfig {
            etag_checksum_enabled: true,
            ..testing::config()
        };
        let with_etags = ObjectFileSystem::new(store.clone(), None, config);
        let etag = with_etags.get_file_checksum(&p("/f")).await.unwrap();
        assert_eq!(etag, Some(format!("{:x}", md5::compute(b"abc"))));
    }

    #[tokio::test]
    async fn closed_filesystem_refuses_work() {
        let store = Arc::new(MemoryStore::new());
        let fs = fs(&store);
        fs.close();
        fs.close();
        assert!(fs.is_closed());
        assert!(matches!(
            fs.exists(&p("/a")).await.unwrap_err(),
            FsError::Closed
        ));
        assert!(matches!(
            fs.create(&p("/a"), "x", true).await.unwrap_err(),
            FsError::Closed
        ));
    }

    #[tokio::test]
    async fn metastore_learns_written_paths() {
        let store = Arc::new(MemoryStore::new());
        let meta = Arc::new(MemoryMetastore::new("tester"));
        let fs = ObjectFileSystem::with_context(testing::context_with_metastore(
            store.clone(),
            meta.clone(),
        ));

        fs.create(&p("/a/b/f"), "x", false).await.unwrap();
        let dir = meta.get(&p("/a/b")).await.unwrap().unwrap();
        assert!(dir.status.is_directory);
        assert_eq!(dir.status.is_empty_directory, Tristate::False);
        assert!(meta.get(&p("/a/b/f")).await.unwrap().unwrap().status.is_file());

        // a lagging listing keeps showing the deleted file
        store.set_list_lag(true);
        fs.create(&p("/a/b/g"), "y", false).await.unwrap();
        assert!(fs.delete(&p("/a/b/f"), false).await.unwrap());
        let listed = fs.list_status(&p("/a/b")).await.unwrap();
        let names = listed.iter().map(|s| s.path.to_string()).collect::<Vec<_>>();
        assert_eq!(names, vec!["/a/b/g"]);
    }
}
