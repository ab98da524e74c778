//! Object-store level records: what HEAD and LIST return and what PUT and
//! COPY accept.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata of a single stored object, as returned by HEAD.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Object key (flat identifier, never starting with `/`).
    pub key: String,

    /// Size in bytes.
    pub content_length: u64,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,

    /// Entity tag, typically the MD5 of the payload.
    pub etag: Option<String>,

    /// Version identifier if the store versions objects.
    pub version_id: Option<String>,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Server-side encryption the object was written with.
    pub encryption: Encryption,
}

/// One entry of a LIST page.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: Option<String>,
}

/// Where a LIST page resumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListContinuation {
    /// Opaque token handed out by a previous V2 page.
    Token(String),
    /// V1 marker: list keys strictly after this one.
    Marker(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    pub max_keys: usize,
    pub continuation: Option<ListContinuation>,
}

impl ListRequest {
    pub fn new(prefix: impl Into<String>, delimiter: Option<&str>, max_keys: usize) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: delimiter.map(str::to_string),
            max_keys,
            continuation: None,
        }
    }
}

/// One page of a LIST, following ListObjects rules: keys are lexicographic,
/// keys grouped under a delimiter collapse into `common_prefixes`.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Continuation token for the next V2 page.
    pub next_token: Option<String>,
    /// Last key or prefix on this page, used as the next V1 marker.
    pub next_marker: Option<String>,
}

impl ListPage {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.common_prefixes.is_empty()
    }
}

/// Server-side encryption applied to written or copied objects.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub enum Encryption {
    #[default]
    None,
    SseS3,
    SseKms { key_id: String },
}

impl Encryption {
    /// Parse `none`, `sse-s3` or `sse-kms:<key id>`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" | "none" => Some(Encryption::None),
            "sse-s3" => Some(Encryption::SseS3),
            other => other
                .strip_prefix("sse-kms:")
                .filter(|id| !id.is_empty())
                .map(|id| Encryption::SseKms {
                    key_id: id.to_string(),
                }),
        }
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encryption::None => f.write_str("none"),
            Encryption::SseS3 => f.write_str("sse-s3"),
            Encryption::SseKms { key_id } => write!(f, "sse-kms:{}", key_id),
        }
    }
}

/// Headers applied to a PUT or the destination of a COPY.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub encryption: Encryption,
}

/// Result of a successful PUT or COPY.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResult {
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub size: u64,
}

/// Body of a zero-byte directory marker.
pub fn empty_body() -> Bytes {
    Bytes::new()
}
