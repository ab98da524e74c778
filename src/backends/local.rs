//! LocalStore, an object store on the local machine: payloads live on disk
//! sharded beneath `base_path/{shard}/{shard}/{id}`, metadata lives in
//! SQLite. Keys are only ever looked up through SQLite, so marker keys
//! ending in `/` need no special casing on disk.

use super::{
    ObjectStore, StoreError, StoreResult, compute_common_prefix, paginate, resume_after,
};
use crate::models::{
    object::{Encryption, ListPage, ListRequest, ObjectMetadata, ObjectSummary, PutOptions, PutResult},
    outcome::KeyDeleteFailure,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt, pin_mut, stream::BoxStream};
use md5::Context;
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Clone, FromRow)]
struct ObjectRow {
    id: String,
    key: String,
    size_bytes: i64,
    etag: Option<String>,
    content_type: Option<String>,
    encryption: Option<String>,
    last_modified: DateTime<Utc>,
    version_id: Option<String>,
}

impl ObjectRow {
    fn summary(&self) -> ObjectSummary {
        ObjectSummary {
            key: self.key.clone(),
            size: self.size_bytes.max(0) as u64,
            last_modified: self.last_modified,
            etag: self.etag.clone(),
        }
    }

    fn metadata(&self) -> ObjectMetadata {
        ObjectMetadata {
            key: self.key.clone(),
            content_length: self.size_bytes.max(0) as u64,
            last_modified: self.last_modified,
            etag: self.etag.clone(),
            version_id: self.version_id.clone(),
            content_type: self.content_type.clone(),
            encryption: self
                .encryption
                .as_deref()
                .and_then(Encryption::parse)
                .unwrap_or_default(),
        }
    }
}

/// LocalStore provides the object-store primitives over local disk:
/// - PUT streams bytes to a temp file, fsyncs, renames into place, then
///   upserts the SQLite row
/// - HEAD and LIST are answered from SQLite alone
/// - DELETE removes the row and then the payload, best effort
/// - COPY duplicates the payload under a fresh id
#[derive(Clone)]
pub struct LocalStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl LocalStore {
    /// Create a LocalStore backed by the provided SQLite pool and using
    /// `base_path` as the root directory for object payloads. The schema
    /// must already be applied (see [`crate::db::open`]).
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Reject keys that cannot be stored: empty, overlong, absolute, with
    /// `..` components or control characters.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN || key.starts_with('/') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        if key.split('/').any(|segment| segment == "..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\0') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Two-level shard identifiers for an object key: the first two bytes
    /// of MD5(key) as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Payload path of the object stored under `id` for `key`.
    /// Parent directories may not exist yet.
    fn object_path(&self, key: &str, id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id);
        path
    }

    async fn fetch_row(&self, key: &str) -> StoreResult<ObjectRow> {
        sqlx::query_as::<_, ObjectRow>(
            "SELECT id, key, size_bytes, etag, content_type, encryption, last_modified, version_id
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StoreError::not_found(key))
    }

    /// Write a stream into a fresh payload file named `id`, returning its
    /// size and MD5. The temp file is removed on every failure path.
    async fn write_payload<S>(&self, key: &str, id: &str, stream: S) -> StoreResult<(u64, String)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let file_path = self.object_path(key, id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Insert or replace the row for `key`, then drop the payload the row
    /// used to point at.
    async fn upsert_row(
        &self,
        key: &str,
        id: &str,
        size_bytes: u64,
        etag: &str,
        options: &PutOptions,
    ) -> StoreResult<PutResult> {
        let previous = match self.fetch_row(key).await {
            Ok(row) => Some(row),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let version_id = Uuid::new_v4().to_string();

        let insert = sqlx::query(
            r#"
            INSERT INTO objects (
                id, key, size_bytes, etag, content_type, encryption, last_modified, version_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                id = excluded.id,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                content_type = excluded.content_type,
                encryption = excluded.encryption,
                last_modified = excluded.last_modified,
                version_id = excluded.version_id
            "#,
        )
        .bind(id)
        .bind(key)
        .bind(size_bytes as i64)
        .bind(etag)
        .bind(options.content_type.clone())
        .bind(options.encryption.to_string())
        .bind(Utc::now())
        .bind(&version_id)
        .execute(&*self.db)
        .await;

        if let Err(err) = insert {
            let _ = fs::remove_file(self.object_path(key, id)).await;
            return Err(StoreError::Sqlx(err));
        }

        if let Some(old) = previous {
            self.remove_payload(key, &old.id).await;
        }

        Ok(PutResult {
            etag: Some(etag.to_string()),
            version_id: Some(version_id),
            size: size_bytes,
        })
    }

    /// Remove a payload file and prune the shard directories it leaves
    /// empty. Failures are logged only.
    async fn remove_payload(&self, key: &str, id: &str) {
        let file_path = self.object_path(key, id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => {
                debug!("failed to remove {}: {}", file_path.display(), err);
                return;
            }
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
    }

    /// Remove empty directories upward, stopping at `stop`, at the first
    /// non-empty directory, or at any unexpected I/O error.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn delete_key(&self, key: &str) -> StoreResult<()> {
        self.ensure_key_safe(key)?;
        let row = match self.fetch_row(key).await {
            Ok(row) => row,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        sqlx::query("DELETE FROM objects WHERE key = ? AND id = ?")
            .bind(key)
            .bind(&row.id)
            .execute(&*self.db)
            .await?;
        self.remove_payload(key, &row.id).await;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn head(&self, key: &str) -> StoreResult<ObjectMetadata> {
        self.ensure_key_safe(key)?;
        Ok(self.fetch_row(key).await?.metadata())
    }

    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        self.ensure_key_safe(key)?;
        let row = self.fetch_row(key).await?;
        let file_path = self.object_path(key, &row.id);
        match fs::read(&file_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::not_found(key)),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// List objects following ListObjects rules: prefix filtering,
    /// delimiter grouping, continuation tokens or markers, lexicographic
    /// order.
    async fn list(&self, request: &ListRequest) -> StoreResult<ListPage> {
        let after = resume_after(request)?;
        let max_keys = request.max_keys.clamp(1, super::MAX_LIST_KEYS);

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, key, size_bytes, etag, content_type, encryption, last_modified, version_id \
             FROM objects WHERE 1 = 1",
        );
        if !request.prefix.is_empty() {
            builder.push(" AND substr(key, 1, ");
            builder.push_bind(request.prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(request.prefix.clone());
        }
        if let Some(after) = &after {
            builder.push(" AND key > ");
            builder.push_bind(after.clone());
        }
        builder.push(" ORDER BY key ASC");
        if request.delimiter.is_none() {
            builder.push(" LIMIT ");
            builder.push_bind((max_keys + 1) as i64);
        }

        // With a delimiter, rows collapse into groups; read until one group
        // past the page so truncation can be detected.
        let mut rows = builder.build_query_as::<ObjectRow>().fetch(&*self.db);
        let mut summaries = Vec::new();
        let mut groups = 0usize;
        let mut last_group: Option<String> = None;
        while let Some(row) = rows.try_next().await? {
            let grouped = request
                .delimiter
                .as_deref()
                .and_then(|d| compute_common_prefix(&row.key, &request.prefix, d));
            if let (Some(prefix), Some(after)) = (&grouped, &after) {
                if after.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            let group = grouped.unwrap_or_else(|| row.key.clone());
            if last_group.as_ref() != Some(&group) {
                groups += 1;
                last_group = Some(group);
            }
            if groups > max_keys + 1 {
                break;
            }
            summaries.push(row.summary());
        }
        drop(rows);

        Ok(paginate(request, after.as_deref(), summaries))
    }

    async fn put(&self, key: &str, body: Bytes, options: &PutOptions) -> StoreResult<PutResult> {
        let stream = futures::stream::once(async move { Ok::<_, io::Error>(body) }).boxed();
        self.put_stream(key, stream, options).await
    }

    async fn put_stream(
        &self,
        key: &str,
        body: BoxStream<'static, io::Result<Bytes>>,
        options: &PutOptions,
    ) -> StoreResult<PutResult> {
        self.ensure_key_safe(key)?;
        let id = Uuid::new_v4().to_string();
        let (size_bytes, etag) = self.write_payload(key, &id, body).await?;
        self.upsert_row(key, &id, size_bytes, &etag, options).await
    }

    async fn delete_one(&self, key: &str) -> StoreResult<()> {
        self.delete_key(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> StoreResult<Vec<KeyDeleteFailure>> {
        let mut failures = Vec::new();
        for key in keys {
            if let Err(err) = self.delete_key(key).await {
                failures.push(KeyDeleteFailure {
                    key: key.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        }
        Ok(failures)
    }

    async fn copy(&self, src: &str, dst: &str, options: &PutOptions) -> StoreResult<PutResult> {
        self.ensure_key_safe(src)?;
        self.ensure_key_safe(dst)?;
        let source = self.fetch_row(src).await?;
        let file = File::open(self.object_path(src, &source.id))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StoreError::not_found(src)
                } else {
                    StoreError::Io(err)
                }
            })?;

        let id = Uuid::new_v4().to_string();
        let stream = tokio_util::io::ReaderStream::new(file);
        let (size_bytes, etag) = self.write_payload(dst, &id, stream).await?;
        let dst_options = PutOptions {
            content_type: source.content_type.clone(),
            encryption: options.encryption.clone(),
        };
        self.upsert_row(dst, &id, size_bytes, &etag, &dst_options).await
    }
}
