//! Absolute, normalized hierarchical paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An absolute slash-separated path such as `/data/2025/part-0`.
///
/// Construction normalizes the input: repeated slashes collapse, a trailing
/// slash is dropped (except for the root), and a missing leading slash is
/// added. `.` and `..` components are not interpreted; qualification
/// against a working directory happens before paths reach this crate.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct FsPath(String);

impl FsPath {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let mut normalized = String::with_capacity(raw.as_ref().len() + 1);
        for segment in raw.as_ref().split('/').filter(|s| !s.is_empty()) {
            normalized.push('/');
            normalized.push_str(segment);
        }
        if normalized.is_empty() {
            normalized.push('/');
        }
        Self(normalized)
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parent directory; `None` for the root.
    pub fn parent(&self) -> Option<FsPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(FsPath::root()),
            Some(pos) => Some(FsPath(self.0[..pos].to_string())),
            None => None,
        }
    }

    /// Final component; empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(pos) => &self.0[pos + 1..],
            None => &self.0,
        }
    }

    pub fn join(&self, child: &str) -> FsPath {
        if self.is_root() {
            FsPath::new(child)
        } else {
            FsPath::new(format!("{}/{}", self.0, child))
        }
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &FsPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Ancestors from the parent upward, root last.
    pub fn ancestors(&self) -> Ancestors {
        Ancestors {
            next: self.parent(),
        }
    }
}

pub struct Ancestors {
    next: Option<FsPath>,
}

impl Iterator for Ancestors {
    type Item = FsPath;

    fn next(&mut self) -> Option<FsPath> {
        let current = self.next.take()?;
        self.next = current.parent();
        Some(current)
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsPath({})", self.0)
    }
}

impl From<&str> for FsPath {
    fn from(value: &str) -> Self {
        FsPath::new(value)
    }
}

impl From<String> for FsPath {
    fn from(value: String) -> Self {
        FsPath::new(value)
    }
}

impl From<FsPath> for String {
    fn from(value: FsPath) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes() {
        assert_eq!(FsPath::new("a//b/").as_str(), "/a/b");
        assert_eq!(FsPath::new("").as_str(), "/");
        assert_eq!(FsPath::new("///").as_str(), "/");
    }

    #[test]
    fn parent_and_name() {
        let p = FsPath::new("/a/b/c.txt");
        assert_eq!(p.name(), "c.txt");
        assert_eq!(p.parent(), Some(FsPath::new("/a/b")));
        assert_eq!(FsPath::new("/a").parent(), Some(FsPath::root()));
        assert_eq!(FsPath::root().parent(), None);
    }

    #[test]
    fn ancestors_end_at_root() {
        let chain: Vec<String> = FsPath::new("/a/b/c")
            .ancestors()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(chain, vec!["/a/b", "/a", "/"]);
    }

    #[test]
    fn ancestry_respects_component_boundaries() {
        assert!(FsPath::new("/a").is_ancestor_of(&FsPath::new("/a/b")));
        assert!(!FsPath::new("/a").is_ancestor_of(&FsPath::new("/ab")));
        assert!(!FsPath::new("/a").is_ancestor_of(&FsPath::new("/a")));
        assert!(FsPath::root().is_ancestor_of(&FsPath::new("/x")));
    }
}
