//! Shared state handed to every engine.

use crate::{
    backends::ObjectStore,
    config::FsConfig,
    errors::{FsError, FsResult},
    keys::path_to_key,
    metastore::MetadataStore,
    models::{
        object::{ListPage, ListRequest, ObjectMetadata, PutOptions, PutResult, empty_body},
        outcome::KeyDeleteFailure,
        path::FsPath,
    },
    services::{
        executor::BoundedExecutor,
        invoker::Invoker,
        observer::{FsObserver, NoopObserver},
    },
};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{io, sync::Arc};

/// The store client, optional metastore, configuration and request
/// machinery of one filesystem instance. Cloning shares all of them.
#[derive(Clone)]
pub struct StoreContext {
    pub store: Arc<dyn ObjectStore>,
    pub metastore: Option<Arc<dyn MetadataStore>>,
    pub config: Arc<FsConfig>,
    pub executor: Arc<BoundedExecutor>,
    pub invoker: Invoker,
    pub observer: Arc<dyn FsObserver>,
}

impl StoreContext {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metastore: Option<Arc<dyn MetadataStore>>,
        config: FsConfig,
    ) -> Self {
        Self::with_observer(store, metastore, config, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        store: Arc<dyn ObjectStore>,
        metastore: Option<Arc<dyn MetadataStore>>,
        config: FsConfig,
        observer: Arc<dyn FsObserver>,
    ) -> Self {
        let executor = Arc::new(BoundedExecutor::new(config.max_concurrency));
        let invoker = Invoker::new(
            executor.clone(),
            observer.clone(),
            config.retry_limit,
            config.retry_interval,
        );
        Self {
            store,
            metastore,
            config: Arc::new(config),
            executor,
            invoker,
            observer,
        }
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    pub fn put_options(&self) -> PutOptions {
        PutOptions {
            content_type: None,
            encryption: self.config.encryption.clone(),
        }
    }

    /// Metastore listings of `path` may stand in for the store.
    pub fn allow_authoritative(&self, path: &FsPath) -> bool {
        self.metastore.is_some() && self.config.is_authoritative_path(path)
    }

    pub fn bulk_delete_enabled(&self) -> bool {
        self.config.multi_object_delete && self.store.supports_multi_delete()
    }

    pub fn delete_batch_size(&self) -> usize {
        self.config
            .max_delete_batch
            .min(self.store.max_delete_batch())
            .max(1)
    }

    pub fn ensure_open(&self) -> FsResult<()> {
        self.executor.ensure_open()
    }

    // Store requests, each run on the executor through the invoker.

    pub async fn head(&self, key: &str) -> FsResult<ObjectMetadata> {
        let path = crate::keys::key_to_path(key);
        self.invoker
            .retry("head", &path, || self.store.head(key))
            .await
    }

    pub async fn get(&self, path: &FsPath) -> FsResult<Bytes> {
        let key = path_to_key(path);
        self.invoker
            .retry("get", path, || self.store.get(&key))
            .await
    }

    pub async fn list(&self, path: &FsPath, request: &ListRequest) -> FsResult<ListPage> {
        self.invoker
            .retry("list", path, || self.store.list(request))
            .await
    }

    /// Write a file body. Not retried: the body may be a one-shot stream
    /// upstream of here.
    pub async fn put_object(&self, path: &FsPath, body: Bytes) -> FsResult<PutResult> {
        let key = path_to_key(path);
        let options = self.put_options();
        self.invoker
            .once("put", path, || self.store.put(&key, body.clone(), &options))
            .await
    }

    /// Upload a file body from a stream. Not retried.
    pub async fn put_stream(
        &self,
        path: &FsPath,
        body: BoxStream<'static, io::Result<Bytes>>,
    ) -> FsResult<PutResult> {
        let key = path_to_key(path);
        let options = self.put_options();
        self.executor
            .run(self.store.put_stream(&key, body, &options))
            .await?
            .map_err(|err| FsError::from_store("put", path, err))
    }

    /// Write a zero-byte directory marker at `key`.
    pub async fn put_marker(&self, key: &str) -> FsResult<PutResult> {
        let path = crate::keys::key_to_path(key);
        let options = self.put_options();
        self.invoker
            .retry("put marker", &path, || {
                self.store.put(key, empty_body(), &options)
            })
            .await
    }

    pub async fn delete_one(&self, key: &str) -> FsResult<()> {
        let path = crate::keys::key_to_path(key);
        self.invoker
            .retry("delete", &path, || self.store.delete_one(key))
            .await
    }

    pub async fn delete_many(&self, path: &FsPath, keys: &[String]) -> FsResult<Vec<KeyDeleteFailure>> {
        self.invoker
            .retry("bulk delete", path, || self.store.delete_many(keys))
            .await
    }

    pub async fn copy(&self, src: &str, dst: &str) -> FsResult<PutResult> {
        let path = crate::keys::key_to_path(src);
        let options = self.put_options();
        self.invoker
            .retry("copy", &path, || self.store.copy(src, dst, &options))
            .await
    }
}
