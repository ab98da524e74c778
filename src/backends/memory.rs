//! In-memory object store.
//!
//! Implements the full [`ObjectStore`] contract over a `BTreeMap`, counts
//! every request, and can be told to misbehave the way real stores do:
//! listings that still show deleted keys, copies that fail part way, keys a
//! bulk delete refuses, and bursts of throttling. Tests and embedders use
//! it where a real bucket would be overkill.

use super::{ObjectStore, StoreError, StoreResult, paginate, resume_after};
use crate::models::{
    object::{Encryption, ListPage, ListRequest, ObjectMetadata, ObjectSummary, PutOptions, PutResult},
    outcome::KeyDeleteFailure,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing::debug;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
    etag: String,
    version_id: String,
    content_type: Option<String>,
    encryption: Encryption,
}

impl StoredObject {
    fn summary(&self, key: &str) -> ObjectSummary {
        ObjectSummary {
            key: key.to_string(),
            size: self.data.len() as u64,
            last_modified: self.last_modified,
            etag: Some(self.etag.clone()),
        }
    }
}

#[derive(Default)]
struct Faults {
    /// Deleted keys keep showing up in LIST results.
    list_lag: bool,
    /// 1-based index of the copy call that fails.
    fail_copy_at: Option<usize>,
    /// Keys every delete refuses.
    delete_denied: HashSet<String>,
    /// Whole bulk delete requests fail with this message.
    fail_delete_many: Option<String>,
    /// Remaining HEAD calls answered with a throttling error.
    throttled_heads: usize,
    /// How long every copy takes.
    copy_delay: Option<Duration>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    stale: BTreeMap<String, ObjectSummary>,
    faults: Faults,
    next_version: u64,
}

/// Request counts by operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub head: usize,
    pub get: usize,
    pub list: usize,
    pub put: usize,
    pub delete_one: usize,
    pub delete_many: usize,
    pub copy: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.head + self.get + self.list + self.put + self.delete_one + self.delete_many + self.copy
    }

    /// Requests that change the store.
    pub fn mutations(&self) -> usize {
        self.put + self.delete_one + self.delete_many + self.copy
    }
}

#[derive(Default)]
struct Counters {
    head: AtomicUsize,
    get: AtomicUsize,
    list: AtomicUsize,
    put: AtomicUsize,
    delete_one: AtomicUsize,
    delete_many: AtomicUsize,
    copy: AtomicUsize,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    counters: Counters,
    multi_delete: bool,
    max_batch: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            counters: Counters::default(),
            multi_delete: true,
            max_batch: super::MAX_ENTRIES_TO_DELETE,
        }
    }

    /// A store without multi-object delete support.
    pub fn without_multi_delete() -> Self {
        Self {
            multi_delete: false,
            ..Self::new()
        }
    }

    /// Cap bulk delete requests at `max_batch` keys.
    pub fn with_max_delete_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // a panic while holding the lock leaves plain data behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an object without counting a request.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        let mut state = self.state();
        let object = Self::new_object(&mut state, data.into(), &PutOptions::default());
        state.stale.remove(key);
        state.objects.insert(key.to_string(), object);
    }

    /// Backdate or postdate an object's modification time.
    pub fn set_last_modified(&self, key: &str, when: DateTime<Utc>) {
        if let Some(object) = self.state().objects.get_mut(key) {
            object.last_modified = when;
        }
    }

    /// Remove an object without counting a request or leaving a stale
    /// listing entry, as another client on a consistent store would.
    pub fn remove(&self, key: &str) {
        let mut state = self.state();
        state.objects.remove(key);
        state.stale.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn encryption_of(&self, key: &str) -> Option<Encryption> {
        self.state().objects.get(key).map(|o| o.encryption.clone())
    }

    /// Keep deleted keys visible to LIST, as an eventually consistent
    /// store does shortly after a delete.
    pub fn set_list_lag(&self, lag: bool) {
        let mut state = self.state();
        state.faults.list_lag = lag;
        if !lag {
            state.stale.clear();
        }
    }

    /// Make the `n`th copy request (1-based, counted from store creation)
    /// fail.
    pub fn fail_copy_at(&self, n: usize) {
        self.state().faults.fail_copy_at = Some(n);
    }

    /// Make every copy take `delay` before it starts.
    pub fn delay_copies(&self, delay: Duration) {
        self.state().faults.copy_delay = Some(delay);
    }

    pub fn deny_delete(&self, key: &str) {
        self.state().faults.delete_denied.insert(key.to_string());
    }

    pub fn fail_bulk_deletes(&self, message: &str) {
        self.state().faults.fail_delete_many = Some(message.to_string());
    }

    pub fn throttle_heads(&self, count: usize) {
        self.state().faults.throttled_heads = count;
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            head: self.counters.head.load(Ordering::SeqCst),
            get: self.counters.get.load(Ordering::SeqCst),
            list: self.counters.list.load(Ordering::SeqCst),
            put: self.counters.put.load(Ordering::SeqCst),
            delete_one: self.counters.delete_one.load(Ordering::SeqCst),
            delete_many: self.counters.delete_many.load(Ordering::SeqCst),
            copy: self.counters.copy.load(Ordering::SeqCst),
        }
    }

    pub fn reset_calls(&self) {
        for counter in [
            &self.counters.head,
            &self.counters.get,
            &self.counters.list,
            &self.counters.put,
            &self.counters.delete_one,
            &self.counters.delete_many,
            &self.counters.copy,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    fn new_object(state: &mut MemoryState, data: Bytes, options: &PutOptions) -> StoredObject {
        state.next_version += 1;
        StoredObject {
            etag: format!("{:x}", md5::compute(&data)),
            data,
            last_modified: Utc::now(),
            version_id: format!("v{}", state.next_version),
            content_type: options.content_type.clone(),
            encryption: options.encryption.clone(),
        }
    }

    fn delete_locked(state: &mut MemoryState, key: &str) -> StoreResult<()> {
        if state.faults.delete_denied.contains(key) {
            return Err(StoreError::AccessDenied(format!("delete of {} refused", key)));
        }
        if let Some(removed) = state.objects.remove(key) {
            if state.faults.list_lag {
                state.stale.insert(key.to_string(), removed.summary(key));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, key: &str) -> StoreResult<ObjectMetadata> {
        self.counters.head.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.faults.throttled_heads > 0 {
            state.faults.throttled_heads -= 1;
            return Err(StoreError::Throttled(format!("HEAD {}", key)));
        }
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| StoreError::not_found(key))?;
        Ok(ObjectMetadata {
            key: key.to_string(),
            content_length: object.data.len() as u64,
            last_modified: object.last_modified,
            etag: Some(object.etag.clone()),
            version_id: Some(object.version_id.clone()),
            content_type: object.content_type.clone(),
            encryption: object.encryption.clone(),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        self.counters.get.fetch_add(1, Ordering::SeqCst);
        self.state()
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn list(&self, request: &ListRequest) -> StoreResult<ListPage> {
        self.counters.list.fetch_add(1, Ordering::SeqCst);
        let after = resume_after(request)?;
        let state = self.state();

        let mut visible: BTreeMap<&str, ObjectSummary> = state
            .objects
            .iter()
            .map(|(k, o)| (k.as_str(), o.summary(k)))
            .collect();
        for (key, summary) in &state.stale {
            visible.entry(key.as_str()).or_insert_with(|| summary.clone());
        }

        let entries = visible
            .into_iter()
            .filter(|(k, _)| k.starts_with(request.prefix.as_str()))
            .filter(|(k, _)| after.as_deref().is_none_or(|a| *k > a))
            .map(|(_, s)| s);
        let page = paginate(request, after.as_deref(), entries);
        debug!(
            "LIST {} -> {} objects, {} prefixes",
            request.prefix,
            page.objects.len(),
            page.common_prefixes.len()
        );
        Ok(page)
    }

    async fn put(&self, key: &str, body: Bytes, options: &PutOptions) -> StoreResult<PutResult> {
        self.counters.put.fetch_add(1, Ordering::SeqCst);
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut state = self.state();
        let object = Self::new_object(&mut state, body, options);
        let result = PutResult {
            etag: Some(object.etag.clone()),
            version_id: Some(object.version_id.clone()),
            size: object.data.len() as u64,
        };
        state.stale.remove(key);
        state.objects.insert(key.to_string(), object);
        Ok(result)
    }

    async fn delete_one(&self, key: &str) -> StoreResult<()> {
        self.counters.delete_one.fetch_add(1, Ordering::SeqCst);
        Self::delete_locked(&mut self.state(), key)
    }

    async fn delete_many(&self, keys: &[String]) -> StoreResult<Vec<KeyDeleteFailure>> {
        self.counters.delete_many.fetch_add(1, Ordering::SeqCst);
        if !self.multi_delete {
            return Err(StoreError::AccessDenied(
                "multi-object delete is not supported".into(),
            ));
        }
        let mut state = self.state();
        if let Some(message) = state.faults.fail_delete_many.clone() {
            return Err(StoreError::Unavailable(message));
        }
        let mut failures = Vec::new();
        for key in keys {
            if let Err(err) = Self::delete_locked(&mut state, key) {
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
        let call = self.counters.copy.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.state().faults.copy_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.faults.fail_copy_at == Some(call) {
            return Err(StoreError::AccessDenied(format!(
                "copy {} -> {} rejected",
                src, dst
            )));
        }
        let source = state
            .objects
            .get(src)
            .cloned()
            .ok_or_else(|| StoreError::not_found(src))?;
        let copy_options = PutOptions {
            content_type: source.content_type.clone(),
            encryption: options.encryption.clone(),
        };
        let object = Self::new_object(&mut state, source.data, &copy_options);
        let result = PutResult {
            etag: Some(object.etag.clone()),
            version_id: Some(object.version_id.clone()),
            size: object.data.len() as u64,
        };
        state.stale.remove(dst);
        state.objects.insert(dst.to_string(), object);
        Ok(result)
    }

    fn supports_multi_delete(&self) -> bool {
        self.multi_delete
    }

    fn max_delete_batch(&self) -> usize {
        self.max_batch
    }
}
