//! Durable metastore over the `path_metadata` and `dir_listing` tables.

use super::{MetaError, MetaResult, MetadataStore, parent_key};
use crate::models::{
    file_status::{FileStatus, Tristate},
    metadata::{DirListing, PathMetadata},
    path::FsPath,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, FromRow)]
struct PathRow {
    path: String,
    is_dir: bool,
    is_empty_dir: Option<bool>,
    length: i64,
    modification_time: DateTime<Utc>,
    owner: String,
    block_size: i64,
    etag: Option<String>,
    version_id: Option<String>,
    is_deleted: bool,
    last_updated: DateTime<Utc>,
}

impl PathRow {
    fn into_metadata(self) -> MetaResult<PathMetadata> {
        if self.length < 0 || self.block_size < 0 {
            return Err(MetaError::Corrupt {
                path: self.path,
                reason: "negative size".to_string(),
            });
        }
        let status = FileStatus {
            path: FsPath::new(&self.path),
            length: self.length as u64,
            modification_time: self.modification_time,
            is_directory: self.is_dir,
            is_empty_directory: match self.is_empty_dir {
                Some(flag) => Tristate::from_bool(flag),
                None => Tristate::Unknown,
            },
            owner: self.owner,
            block_size: self.block_size as u64,
            etag: self.etag,
            version_id: self.version_id,
        };
        Ok(PathMetadata {
            status,
            is_deleted: self.is_deleted,
            last_updated: self.last_updated,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT path, is_dir, is_empty_dir, length, modification_time, owner, \
     block_size, etag, version_id, is_deleted, last_updated FROM path_metadata";

#[derive(Clone)]
pub struct SqliteMetastore {
    db: Arc<SqlitePool>,
    owner: String,
    tombstone_ttl: Option<Duration>,
}

impl SqliteMetastore {
    /// The schema must already be applied (see [`crate::db::open`]).
    pub fn new(db: Arc<SqlitePool>, owner: impl Into<String>) -> Self {
        Self {
            db,
            owner: owner.into(),
            tombstone_ttl: None,
        }
    }

    pub fn with_tombstone_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.tombstone_ttl = Duration::from_std(ttl).ok();
        self
    }

    fn live(&self, entry: &PathMetadata) -> bool {
        match self.tombstone_ttl {
            Some(ttl) if entry.is_deleted => entry.last_updated + ttl >= Utc::now(),
            _ => true,
        }
    }

    async fn upsert(&self, entry: &PathMetadata) -> MetaResult<()> {
        let status = &entry.status;
        sqlx::query(
            r#"
            INSERT INTO path_metadata (
                path, parent, is_dir, is_empty_dir, length, modification_time, owner,
                block_size, etag, version_id, is_deleted, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                parent = excluded.parent,
                is_dir = excluded.is_dir,
                is_empty_dir = excluded.is_empty_dir,
                length = excluded.length,
                modification_time = excluded.modification_time,
                owner = excluded.owner,
                block_size = excluded.block_size,
                etag = excluded.etag,
                version_id = excluded.version_id,
                is_deleted = excluded.is_deleted,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(status.path.as_str())
        .bind(parent_key(&status.path))
        .bind(status.is_directory)
        .bind(status.is_empty_directory.as_option())
        .bind(status.length as i64)
        .bind(status.modification_time)
        .bind(&status.owner)
        .bind(status.block_size as i64)
        .bind(status.etag.clone())
        .bind(status.version_id.clone())
        .bind(entry.is_deleted)
        .bind(entry.last_updated)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetastore {
    async fn get(&self, path: &FsPath) -> MetaResult<Option<PathMetadata>> {
        let row = sqlx::query_as::<_, PathRow>(&format!("{} WHERE path = ?", SELECT_COLUMNS))
            .bind(path.as_str())
            .fetch_optional(&*self.db)
            .await?;
        match row {
            Some(row) => {
                let entry = row.into_metadata()?;
                if self.live(&entry) {
                    Ok(Some(entry))
                } else {
                    debug!("tombstone for {} expired", path);
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    async fn put(&self, status: &FileStatus) -> MetaResult<()> {
        self.upsert(&PathMetadata::live(status.clone())).await
    }

    async fn delete(&self, path: &FsPath) -> MetaResult<()> {
        self.upsert(&PathMetadata::tombstone(path.clone(), &self.owner))
            .await?;
        sqlx::query("DELETE FROM dir_listing WHERE path = ?")
            .bind(path.as_str())
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn list_children(&self, path: &FsPath) -> MetaResult<Option<DirListing>> {
        let rows = sqlx::query_as::<_, PathRow>(&format!(
            "{} WHERE parent = ? AND path <> parent ORDER BY path ASC",
            SELECT_COLUMNS
        ))
        .bind(path.as_str())
        .fetch_all(&*self.db)
        .await?;
        let is_authoritative = sqlx::query_scalar::<_, bool>(
            "SELECT authoritative FROM dir_listing WHERE path = ?",
        )
        .bind(path.as_str())
        .fetch_optional(&*self.db)
        .await?
        .unwrap_or(false);

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = row.into_metadata()?;
            if self.live(&entry) {
                entries.push(entry);
            }
        }
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
        sqlx::query(
            "INSERT INTO dir_listing (path, authoritative) VALUES (?, ?)
             ON CONFLICT(path) DO UPDATE SET authoritative = excluded.authoritative",
        )
        .bind(path.as_str())
        .bind(authoritative)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}
