//! Status resolution: the metastore first, then layered store probes.
//!
//! Probes run cheapest first: HEAD of the exact key, HEAD of the marker
//! key, then a one-result LIST beneath the directory prefix. Absence is a
//! typed `None`; every other store fault propagates unchanged.

use crate::{
    errors::FsResult,
    keys::{key_to_path, maybe_add_trailing_slash, object_represents_directory, path_to_key},
    models::{
        file_status::{FileStatus, ProbeSet, StatusProbe, Tristate},
        object::ListRequest,
        path::FsPath,
    },
    services::context::StoreContext,
};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Resolve `path`, consulting the metastore before the store and recording
/// whatever the store reveals.
pub async fn resolve(
    ctx: &StoreContext,
    path: &FsPath,
    need_empty_dir_flag: bool,
    probes: ProbeSet,
) -> FsResult<Option<FileStatus>> {
    ctx.ensure_open()?;
    debug!("Getting path status for {} ({})", path, path_to_key(path));

    let Some(metastore) = &ctx.metastore else {
        return raw_status(ctx, path, probes, None).await;
    };

    let Some(entry) = metastore.get(path).await? else {
        let status = raw_status(ctx, path, probes, None).await?;
        if let Some(status) = &status {
            metastore.put(status).await?;
        }
        return Ok(status);
    };

    if entry.is_deleted {
        debug!(
            "{} is recorded as deleted at {}",
            path, entry.status.modification_time
        );
        return Ok(None);
    }

    let cached = entry.status;
    if cached.is_file() && !ctx.allow_authoritative(path) && probes.contains(StatusProbe::Head) {
        match raw_status(ctx, path, probes, None).await? {
            Some(found) if found.modification_time > cached.modification_time => {
                debug!("metastore entry for {} is outdated; refreshing", path);
                metastore.put(&found).await?;
                return Ok(Some(found));
            }
            Some(_) => {}
            None => warn!(
                "Failed to find file {}. Either it is not yet visible, or it has been deleted.",
                path
            ),
        }
        return Ok(Some(cached));
    }

    if !(need_empty_dir_flag && cached.is_directory) {
        return Ok(Some(cached));
    }
    if cached.is_empty_directory != Tristate::Unknown {
        return Ok(Some(cached));
    }

    let mut tombstones = HashSet::new();
    if let Some(children) = metastore.list_children(path).await? {
        let emptiness = children.emptiness();
        if emptiness != Tristate::Unknown {
            return Ok(Some(cached.with_empty_directory(emptiness)));
        }
        tombstones = children.tombstones();
    }

    debug!("metastore does not know if {} is empty, asking the store", path);
    let mut dir_probes = ProbeSet::LIST_ONLY;
    if probes.contains(StatusProbe::DirMarker) {
        dir_probes = dir_probes.with(StatusProbe::DirMarker);
    }
    match raw_status(ctx, path, dir_probes, Some(&tombstones)).await? {
        Some(found) => {
            metastore.put(&found).await?;
            Ok(Some(found))
        }
        // the metastore's record of the directory outranks a lagging store
        None => Ok(Some(cached.with_empty_directory(Tristate::True))),
    }
}

/// Probe the store alone for `path`, ignoring keys of `tombstones` in the
/// LIST probe.
pub async fn raw_status(
    ctx: &StoreContext,
    path: &FsPath,
    probes: ProbeSet,
    tombstones: Option<&HashSet<FsPath>>,
) -> FsResult<Option<FileStatus>> {
    raw_key_status(ctx, path, &path_to_key(path), probes, tombstones).await
}

/// [`raw_status`] for an explicit key, which may carry a trailing `/`.
pub async fn raw_key_status(
    ctx: &StoreContext,
    path: &FsPath,
    key: &str,
    probes: ProbeSet,
    tombstones: Option<&HashSet<FsPath>>,
) -> FsResult<Option<FileStatus>> {
    if !key.is_empty() {
        if probes.contains(StatusProbe::Head) && !key.ends_with('/') {
            match ctx.head(key).await {
                Ok(meta) => {
                    debug!("Found exact file: normal file {}", key);
                    return Ok(Some(FileStatus::file(
                        path.clone(),
                        meta.content_length,
                        meta.last_modified,
                        ctx.config.block_size,
                        ctx.owner(),
                        meta.etag,
                        meta.version_id,
                    )));
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        if probes.contains(StatusProbe::DirMarker) {
            let marker = maybe_add_trailing_slash(key);
            match ctx.head(&marker).await {
                Ok(meta) if object_represents_directory(&marker, meta.content_length) => {
                    debug!("Found file (with /): fake directory");
                    return Ok(Some(FileStatus::directory(
                        path.clone(),
                        Tristate::True,
                        ctx.owner(),
                    )));
                }
                Ok(meta) => {
                    warn!("Found file (with /): real file? should not happen: {}", key);
                    return Ok(Some(FileStatus::file(
                        path.clone(),
                        meta.content_length,
                        meta.last_modified,
                        ctx.config.block_size,
                        ctx.owner(),
                        meta.etag,
                        meta.version_id,
                    )));
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
    }

    if probes.contains(StatusProbe::List) {
        let dir_key = maybe_add_trailing_slash(key);
        let request = ListRequest::new(dir_key, Some("/"), 1);
        match ctx.list(path, &request).await {
            Ok(page) => {
                let unexplained = |k: &String| {
                    tombstones.is_none_or(|dead| !dead.contains(&key_to_path(k)))
                };
                let has_children = page.common_prefixes.iter().any(unexplained)
                    || page.objects.iter().map(|o| &o.key).any(unexplained);
                if has_children {
                    debug!(
                        "Found path as directory (with /): {}/{}",
                        page.common_prefixes.len(),
                        page.objects.len()
                    );
                    return Ok(Some(FileStatus::directory(
                        path.clone(),
                        Tristate::False,
                        ctx.owner(),
                    )));
                } else if key.is_empty() {
                    debug!("Found root directory");
                    return Ok(Some(FileStatus::directory(
                        path.clone(),
                        Tristate::True,
                        ctx.owner(),
                    )));
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }

    debug!("Not Found: {}", path);
    Ok(None)
}
