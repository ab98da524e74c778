//! Bulk key deletion and recursive delete.

use crate::{
    errors::{FsError, FsResult},
    keys::{key_to_path, maybe_add_trailing_slash, path_to_key},
    models::{
        file_status::{FileStatus, ProbeSet, Tristate},
        outcome::{BulkDeleteOutcome, KeyDeleteFailure},
        path::FsPath,
    },
    services::{
        context::StoreContext,
        listing::{ListingOptions, ObjectListing},
        markers::ensure_parent_markers,
        status::resolve,
    },
};
use futures::{StreamExt, stream};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Error code recorded for keys of a request that failed as a whole.
fn failure_code(err: &FsError) -> &'static str {
    match err {
        FsError::AccessDenied { .. } => "AccessDenied",
        FsError::Transient { .. } => "ServiceUnavailable",
        _ => "InternalError",
    }
}

/// Faults that end the operation instead of being recorded per key.
fn is_fatal(err: &FsError) -> bool {
    matches!(err, FsError::Interrupted(_) | FsError::Closed)
}

/// Delete `keys`, in bulk requests when the store supports them and one by
/// one otherwise, and report what happened to every key.
///
/// Unless `is_marker_cleanup` is set, every deleted key is tombstoned in
/// the metastore. Nothing is rolled back when some keys fail; the outcome
/// says which. A metastore failure does not stop the tombstoning of the
/// other keys and is reported as `MetastoreOutOfSync`, outcome attached.
/// The root key is refused before any request is made.
pub async fn remove_keys(
    ctx: &StoreContext,
    keys: &[String],
    is_marker_cleanup: bool,
) -> FsResult<BulkDeleteOutcome> {
    ctx.ensure_open()?;
    if let Some(root) = keys.iter().find(|k| k.is_empty() || k.as_str() == "/") {
        return Err(FsError::InvalidRequest(format!(
            "refusing to delete the root key `{}`",
            root
        )));
    }

    let mut seen = HashSet::new();
    let keys = keys
        .iter()
        .filter(|k| seen.insert(k.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if keys.is_empty() {
        return Ok(BulkDeleteOutcome::default());
    }

    let outcome = if ctx.bulk_delete_enabled() {
        delete_in_batches(ctx, &keys).await?
    } else {
        delete_one_by_one(ctx, &keys).await?
    };

    let mut unrecorded = None;
    if !is_marker_cleanup {
        if let Some(metastore) = &ctx.metastore {
            for key in &outcome.succeeded_keys {
                if let Err(err) = metastore.delete(&key_to_path(key)).await {
                    warn!("could not record deletion of {}: {}", key, err);
                    unrecorded.get_or_insert(err);
                }
            }
        }
    }

    if !outcome.is_complete() {
        warn!(
            "{} of {} keys could not be deleted: {:?}",
            outcome.failed_keys.len(),
            keys.len(),
            outcome.failed_key_names()
        );
        ctx.observer.on_bulk_delete_partial_failure(&outcome);
    }
    match unrecorded {
        Some(source) => Err(FsError::MetastoreOutOfSync {
            operation: "delete".to_string(),
            outcome,
            source,
        }),
        None => Ok(outcome),
    }
}

async fn delete_in_batches(ctx: &StoreContext, keys: &[String]) -> FsResult<BulkDeleteOutcome> {
    let batch_size = ctx.delete_batch_size();
    debug!(
        "Initiating delete operation for {} keys in batches of {}",
        keys.len(),
        batch_size
    );

    let results = stream::iter(keys.chunks(batch_size))
        .map(|batch| async move {
            let path = key_to_path(&batch[0]);
            match ctx.delete_many(&path, batch).await {
                Ok(failures) => Ok(BulkDeleteOutcome::from_failures(batch, failures)),
                Err(err) if is_fatal(&err) => Err(err),
                Err(err) => {
                    warn!("bulk delete of {} keys failed: {}", batch.len(), err);
                    Ok(BulkDeleteOutcome::all_failed(
                        batch,
                        failure_code(&err),
                        &err.to_string(),
                    ))
                }
            }
        })
        .buffer_unordered(ctx.executor.capacity())
        .collect::<Vec<_>>()
        .await;

    let mut outcome = BulkDeleteOutcome::default();
    for result in results {
        outcome.merge(result?);
    }
    Ok(outcome)
}

async fn delete_one_by_one(ctx: &StoreContext, keys: &[String]) -> FsResult<BulkDeleteOutcome> {
    let results = stream::iter(keys)
        .map(|key| async move { (key, ctx.delete_one(key).await) })
        .buffer_unordered(ctx.executor.capacity())
        .collect::<Vec<_>>()
        .await;

    let mut failures = Vec::new();
    for (key, result) in results {
        match result {
            Ok(()) => {}
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) => failures.push(KeyDeleteFailure {
                key: key.clone(),
                code: failure_code(&err).to_string(),
                message: err.to_string(),
            }),
        }
    }
    Ok(BulkDeleteOutcome::from_failures(keys, failures))
}

/// Turn an outcome with failed keys into a `PartialFailure`.
pub fn ensure_complete(operation: &str, outcome: BulkDeleteOutcome) -> FsResult<BulkDeleteOutcome> {
    if outcome.is_complete() {
        Ok(outcome)
    } else {
        Err(FsError::PartialFailure {
            operation: operation.to_string(),
            outcome,
        })
    }
}

/// Delete a file or directory.
///
/// Returns `false` when nothing exists at `path`. A non-empty directory
/// needs `recursive`. The root itself is never removed: an empty root is
/// a successful no-op, a recursive delete of a non-empty root returns
/// `false`. Afterwards the parent gets a marker if it would otherwise
/// vanish.
pub async fn delete(ctx: &StoreContext, path: &FsPath, recursive: bool) -> FsResult<bool> {
    let Some(status) = resolve(ctx, path, true, ProbeSet::ALL).await? else {
        debug!("Couldn't delete {} - does not exist", path);
        ctx.observer
            .on_error_ignored("delete", &FsError::NotFound(path.clone()));
        return Ok(false);
    };

    if path.is_root() {
        return reject_root_delete(&status, recursive);
    }

    let key = path_to_key(path);
    if status.is_directory {
        debug!("delete: Path is a directory: {}", path);
        let empty = status.is_empty_directory == Tristate::True;
        if !empty && !recursive {
            return Err(FsError::DirectoryNotEmpty(path.clone()));
        }
        if recursive {
            // a marker may hide children, so a recursive delete always lists
            delete_tree(ctx, path).await?;
        } else {
            debug!("Deleting fake empty directory {}", key);
            let marker = maybe_add_trailing_slash(&key);
            ensure_complete("delete", remove_keys(ctx, &[marker], false).await?)?;
        }
        if let Some(metastore) = &ctx.metastore {
            metastore.delete(path).await?;
        }
    } else {
        debug!("delete: Path is a file: {}", key);
        ensure_complete("delete", remove_keys(ctx, &[key], false).await?)?;
    }

    match ensure_parent_markers(ctx, path).await {
        Ok(()) => {}
        Err(err @ FsError::AccessDenied { .. }) => {
            warn!(
                "Cannot create directory marker at {:?}: {}",
                path.parent(),
                err
            );
            ctx.observer.on_error_ignored("create parent marker", &err);
        }
        Err(err) => return Err(err),
    }
    Ok(true)
}

fn reject_root_delete(status: &FileStatus, recursive: bool) -> FsResult<bool> {
    info!("rm of the root directory, recursive = {}", recursive);
    if status.is_empty_directory == Tristate::True {
        info!("root is empty, nothing to delete");
        return Ok(true);
    }
    if recursive {
        warn!("Cannot delete root path: it is not empty");
        Ok(false)
    } else {
        Err(FsError::DirectoryNotEmpty(status.path.clone()))
    }
}

/// Delete every key under the directory `path`, markers included, in
/// batches as the listing yields them. Keys a stale listing still shows
/// are deleted again rather than skipped.
async fn delete_tree(ctx: &StoreContext, path: &FsPath) -> FsResult<BulkDeleteOutcome> {
    let batch_size = ctx.delete_batch_size();
    let mut listing = ObjectListing::new(ctx.clone(), path.clone(), ListingOptions::ALL_KEYS);
    let mut outcome = BulkDeleteOutcome::default();
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(entry) = listing.next_entry().await? {
        batch.push(entry.key);
        if batch.len() >= batch_size {
            outcome.merge(remove_keys(ctx, &batch, false).await?);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        outcome.merge(remove_keys(ctx, &batch, false).await?);
    }
    if let Some(metastore) = &ctx.metastore {
        for dir in listing.known_directories() {
            metastore.delete(dir).await?;
        }
    }

    debug!(
        "deleted {} keys under {}",
        outcome.succeeded_keys.len(),
        path
    );
    ensure_complete("delete", outcome)
}
