//! The object-store client contract and its implementations.
//!
//! The filesystem layer consumes stores only through [`ObjectStore`]; a
//! missing key is always reported as [`StoreError::NotFound`] so callers can
//! tell absence apart from throttling, permission or transport faults.

pub mod local;
pub mod memory;

use crate::models::{
    object::{ListPage, ListRequest, ObjectMetadata, PutOptions, PutResult},
    outcome::KeyDeleteFailure,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};
use std::io;
use thiserror::Error;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Largest number of keys a single bulk DELETE may carry.
pub const MAX_ENTRIES_TO_DELETE: usize = 1000;

/// Largest page a LIST returns regardless of what was asked for.
pub const MAX_LIST_KEYS: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("request interrupted: {0}")]
    Interrupted(String),
    #[error("invalid continuation token")]
    InvalidToken,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(key: &str) -> Self {
        StoreError::NotFound {
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Faults worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Throttled(_) | StoreError::Unavailable(_))
    }

    /// Short machine-readable code, as reported in bulk delete failures.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NoSuchKey",
            StoreError::InvalidKey(_) => "InvalidKey",
            StoreError::Throttled(_) => "SlowDown",
            StoreError::Unavailable(_) => "ServiceUnavailable",
            StoreError::AccessDenied(_) => "AccessDenied",
            StoreError::Interrupted(_) => "Interrupted",
            StoreError::InvalidToken => "InvalidArgument",
            StoreError::Sqlx(_) | StoreError::Io(_) => "InternalError",
        }
    }
}

/// Primitive operations of a flat key-value object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata of the object at exactly `key`.
    async fn head(&self, key: &str) -> StoreResult<ObjectMetadata>;

    /// Full payload of the object at `key`.
    async fn get(&self, key: &str) -> StoreResult<Bytes>;

    /// One page of keys under `request.prefix`.
    async fn list(&self, request: &ListRequest) -> StoreResult<ListPage>;

    /// Create or overwrite the object at `key`.
    async fn put(&self, key: &str, body: Bytes, options: &PutOptions) -> StoreResult<PutResult>;

    /// Upload from a stream. The default buffers the whole body.
    async fn put_stream(
        &self,
        key: &str,
        mut body: BoxStream<'static, io::Result<Bytes>>,
        options: &PutOptions,
    ) -> StoreResult<PutResult> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        self.put(key, buffer.freeze(), options).await
    }

    /// Delete one key. Deleting a missing key succeeds.
    async fn delete_one(&self, key: &str) -> StoreResult<()>;

    /// Delete many keys in one request, returning the keys that could not
    /// be deleted. Missing keys count as deleted. An `Err` means the whole
    /// request failed and nothing may be presumed deleted.
    async fn delete_many(&self, keys: &[String]) -> StoreResult<Vec<KeyDeleteFailure>>;

    /// Server-side copy; the destination takes `options` for its headers.
    async fn copy(&self, src: &str, dst: &str, options: &PutOptions) -> StoreResult<PutResult>;

    /// Whether `delete_many` is available at all.
    fn supports_multi_delete(&self) -> bool {
        true
    }

    /// Per-request key limit of `delete_many`.
    fn max_delete_batch(&self) -> usize {
        MAX_ENTRIES_TO_DELETE
    }
}

/// Token encoding shared by the bundled stores: the last key returned,
/// base64 so callers treat it as opaque.
pub(crate) fn encode_token(last_key: &str) -> String {
    use base64::{Engine as _, engine::general_purpose};
    general_purpose::URL_SAFE_NO_PAD.encode(last_key.as_bytes())
}

pub(crate) fn decode_token(token: &str) -> StoreResult<String> {
    use base64::{Engine as _, engine::general_purpose};
    let raw = general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| StoreError::InvalidToken)?;
    String::from_utf8(raw).map_err(|_| StoreError::InvalidToken)
}

/// Group `key` under `delimiter` relative to `prefix`, ListObjects style.
///
/// Returns the common prefix the key collapses into, or `None` when the key
/// is listed on its own.
pub(crate) fn compute_common_prefix(key: &str, prefix: &str, delimiter: &str) -> Option<String> {
    let after_prefix = key.strip_prefix(prefix)?;
    after_prefix
        .find(delimiter)
        .map(|pos| format!("{}{}", prefix, &after_prefix[..pos + delimiter.len()]))
}

/// Resume point of a request: keys strictly greater than this are listed.
pub(crate) fn resume_after(request: &ListRequest) -> StoreResult<Option<String>> {
    use crate::models::object::ListContinuation;
    match &request.continuation {
        None => Ok(None),
        Some(ListContinuation::Token(token)) => decode_token(token).map(Some),
        Some(ListContinuation::Marker(marker)) => Ok(Some(marker.clone())),
    }
}

/// Fold a lexicographically sorted key stream into one page.
///
/// `entries` must already be filtered by prefix and resume point. Grouped
/// keys count once per common prefix against `max_keys`, and a prefix that
/// was the resume point is skipped along with everything under it.
pub(crate) fn paginate<I>(request: &ListRequest, after: Option<&str>, entries: I) -> ListPage
where
    I: IntoIterator<Item = crate::models::object::ObjectSummary>,
{
    let max_keys = request.max_keys.clamp(1, MAX_LIST_KEYS);
    let mut page = ListPage::default();
    let mut last_emitted: Option<String> = None;
    let mut count = 0usize;

    for summary in entries {
        let grouped = request
            .delimiter
            .as_deref()
            .and_then(|d| compute_common_prefix(&summary.key, &request.prefix, d));

        let entry_key = match &grouped {
            Some(prefix) => {
                // everything under an already-returned prefix is covered by it
                if after.is_some_and(|a| a.starts_with(prefix.as_str()))
                    || page.common_prefixes.last() == Some(prefix)
                {
                    continue;
                }
                prefix.clone()
            }
            None => summary.key.clone(),
        };

        if count == max_keys {
            page.is_truncated = true;
            break;
        }
        count += 1;
        last_emitted = Some(entry_key);
        match grouped {
            Some(prefix) => page.common_prefixes.push(prefix),
            None => page.objects.push(summary),
        }
    }

    if page.is_truncated {
        if let Some(last) = last_emitted {
            page.next_token = Some(encode_token(&last));
            page.next_marker = Some(last);
        }
    }
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::object::{ListContinuation, ObjectSummary};
    use chrono::Utc;

    fn summaries(keys: &[&str]) -> Vec<ObjectSummary> {
        keys.iter()
            .map(|k| ObjectSummary {
                key: k.to_string(),
                size: 1,
                last_modified: Utc::now(),
                etag: None,
            })
            .collect()
    }

    #[test]
    fn common_prefix_respects_requested_prefix() {
        assert_eq!(
            compute_common_prefix("a/b/c.txt", "a/", "/"),
            Some("a/b/".to_string())
        );
        assert_eq!(compute_common_prefix("a/c.txt", "a/", "/"), None);
        assert_eq!(compute_common_prefix("b/c.txt", "a/", "/"), None);
    }

    #[test]
    fn delimiter_groups_count_once() {
        let request = ListRequest::new("", Some("/"), 2);
        let page = paginate(
            &request,
            None,
            summaries(&["a/1", "a/2", "a/3", "b/1", "c"]),
        );
        assert_eq!(page.common_prefixes, vec!["a/", "b/"]);
        assert!(page.objects.is_empty());
        assert!(page.is_truncated);
        assert_eq!(page.next_marker.as_deref(), Some("b/"));
    }

    #[test]
    fn resuming_after_a_prefix_skips_its_members() {
        let mut request = ListRequest::new("", Some("/"), 10);
        request.continuation = Some(ListContinuation::Token(encode_token("a/")));
        let after = resume_after(&request).unwrap();
        let all = summaries(&["a/1", "a/2", "b/1", "c"]);
        let remaining = all
            .into_iter()
            .filter(|s| after.as_deref().is_none_or(|a| s.key.as_str() > a));
        let page = paginate(&request, after.as_deref(), remaining);
        assert_eq!(page.common_prefixes, vec!["b/"]);
        assert_eq!(page.objects.len(), 1);
        assert!(!page.is_truncated);
    }

    #[test]
    fn tokens_are_opaque_but_reversible() {
        let token = encode_token("dir/with/key");
        assert_ne!(token, "dir/with/key");
        assert_eq!(decode_token(&token).unwrap(), "dir/with/key");
        assert!(decode_token("!!!").is_err());
    }
}
