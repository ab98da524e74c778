//! Translation between hierarchical paths and flat object keys.

use crate::models::path::FsPath;

/// Object key for `path`: the path without its leading `/`. The root maps
/// to the empty key.
pub fn path_to_key(path: &FsPath) -> String {
    path.as_str().trim_start_matches('/').to_string()
}

/// Path for `key`. A trailing `/` (marker key) is dropped by normalization.
pub fn key_to_path(key: &str) -> FsPath {
    FsPath::new(format!("/{}", key))
}

/// Append `/` unless the key already ends in one or is the root key.
pub fn maybe_add_trailing_slash(key: &str) -> String {
    if !key.is_empty() && !key.ends_with('/') {
        format!("{}/", key)
    } else {
        key.to_string()
    }
}

/// True when the key names a directory marker: ends in `/` with no bytes.
pub fn object_represents_directory(key: &str, size: u64) -> bool {
    !key.is_empty() && key.ends_with('/') && size == 0
}

/// Marker key of a directory path. The root has no marker.
pub fn marker_key(path: &FsPath) -> Option<String> {
    if path.is_root() {
        None
    } else {
        Some(maybe_add_trailing_slash(&path_to_key(path)))
    }
}
