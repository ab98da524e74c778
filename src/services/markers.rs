//! Directory marker upkeep.
//!
//! A marker `dir/` keeps an otherwise empty directory visible. Writes below
//! a directory make its markers redundant, and deletes can leave a parent
//! with nothing to show for itself.

use crate::{
    errors::FsResult,
    keys::marker_key,
    models::{
        file_status::{FileStatus, ProbeSet, Tristate},
        path::FsPath,
    },
    services::{context::StoreContext, delete::remove_keys, status::raw_status},
};
use tracing::debug;

/// Make sure the parent of `path` still exists once `path` is gone: when a
/// LIST under the parent shows nothing, put a marker there. A new marker
/// keeps every ancestor above it visible too, so nothing higher is checked.
pub async fn ensure_parent_markers(ctx: &StoreContext, path: &FsPath) -> FsResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let Some(key) = marker_key(&parent) else {
        return Ok(());
    };

    let tombstones = match &ctx.metastore {
        Some(metastore) => metastore
            .list_children(&parent)
            .await?
            .map(|listing| listing.tombstones()),
        None => None,
    };
    if raw_status(ctx, &parent, ProbeSet::LIST_ONLY, tombstones.as_ref())
        .await?
        .is_some()
    {
        return Ok(());
    }

    debug!("Creating new fake directory at {}", parent);
    ctx.put_marker(&key).await?;
    if let Some(metastore) = &ctx.metastore {
        metastore
            .put(&FileStatus::directory(parent, Tristate::True, ctx.owner()))
            .await?;
    }
    Ok(())
}

/// Delete the markers of every ancestor of `path` after a write beneath
/// them. Best effort: failures are logged and reported to the observer,
/// never returned.
pub async fn remove_stale_markers(ctx: &StoreContext, path: &FsPath) {
    let keys = path
        .ancestors()
        .filter_map(|ancestor| marker_key(&ancestor))
        .collect::<Vec<_>>();
    if keys.is_empty() {
        return;
    }

    match remove_keys(ctx, &keys, true).await {
        Ok(outcome) if outcome.is_complete() => {}
        Ok(outcome) => debug!(
            "could not remove markers {:?} above {}",
            outcome.failed_key_names(),
            path
        ),
        Err(err) => {
            debug!("While deleting keys {:?}: {}", keys, err);
            ctx.observer.on_error_ignored("remove stale markers", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::MemoryStore,
        services::{observer::CountingObserver, testing},
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn recreates_only_the_missing_parent() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a/other", b"x".to_vec());
        let ctx = testing::context(store.clone());

        // /a/b/c was the last thing in /a/b; /a still has a child
        ensure_parent_markers(&ctx, &FsPath::new("/a/b/c")).await.unwrap();
        assert!(store.contains("a/b/"));
        assert!(!store.contains("a/"));
        assert_eq!(store.calls().put, 1);
    }

    #[tokio::test]
    async fn existing_parent_needs_no_marker() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a/sibling", b"x".to_vec());
        let ctx = testing::context(store.clone());

        ensure_parent_markers(&ctx, &FsPath::new("/a/gone")).await.unwrap();
        assert_eq!(store.calls().put, 0);
    }

    #[tokio::test]
    async fn root_children_need_no_marker() {
        let store = Arc::new(MemoryStore::new());
        let ctx = testing::context(store.clone());
        ensure_parent_markers(&ctx, &FsPath::new("/top")).await.unwrap();
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn stale_markers_are_removed_in_one_request() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a/", Vec::new());
        store.insert("a/b/", Vec::new());
        store.insert("a/b/file", b"data".to_vec());
        let ctx = testing::context(store.clone());

        remove_stale_markers(&ctx, &FsPath::new("/a/b/file")).await;
        assert_eq!(store.keys(), vec!["a/b/file".to_string()]);
        assert_eq!(store.calls().delete_many, 1);
    }

    #[tokio::test]
    async fn marker_cleanup_failures_are_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a/", Vec::new());
        store.fail_bulk_deletes("store is down");
        let observer = Arc::new(CountingObserver::default());
        let ctx = StoreContext::with_observer(
            store.clone(),
            None,
            testing::config(),
            observer.clone(),
        );

        remove_stale_markers(&ctx, &FsPath::new("/a/file")).await;
        assert!(store.contains("a/"));
        assert_eq!(observer.partial_deletes(), 1);
    }
}
