use crate::models::{object::Encryption, path::FsPath};
use anyhow::{Context, Result, anyhow};
use clap::Args;
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Which LIST API pages through a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListingVersion {
    /// Marker paging: resume after the last key or prefix returned.
    V1,
    /// Opaque continuation tokens.
    #[default]
    V2,
}

impl FromStr for ListingVersion {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "v1" => Ok(ListingVersion::V1),
            "2" | "v2" => Ok(ListingVersion::V2),
            other => Err(anyhow!("unknown listing version `{}`", other)),
        }
    }
}

/// Centralized filesystem configuration.
/// Combines defaults, environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Use the store's multi-object delete when it has one.
    pub multi_object_delete: bool,
    /// Keys per bulk delete request.
    pub max_delete_batch: usize,
    /// Keys requested per LIST page; stores clamp this to their own limit.
    pub list_page_size: usize,
    pub listing_version: ListingVersion,
    /// Store requests allowed in flight per filesystem instance.
    pub max_concurrency: usize,
    /// Attempts made for a request failing with a transient fault.
    pub retry_limit: u32,
    /// Base delay between retries; doubles per attempt.
    pub retry_interval: Duration,
    /// Treat every metastore directory listing as complete.
    pub authoritative: bool,
    /// Directories whose metastore listings are complete.
    pub authoritative_paths: Vec<FsPath>,
    pub block_size: u64,
    /// Report object etags as file checksums.
    pub etag_checksum_enabled: bool,
    /// Encryption applied to every PUT and COPY.
    pub encryption: Encryption,
    pub owner: String,
    /// Lifetime of metastore tombstones; `None` keeps them forever.
    pub metastore_ttl: Option<Duration>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            multi_object_delete: true,
            max_delete_batch: 1000,
            list_page_size: 5000,
            listing_version: ListingVersion::V2,
            max_concurrency: 10,
            retry_limit: 7,
            retry_interval: Duration::from_millis(500),
            authoritative: false,
            authoritative_paths: Vec::new(),
            block_size: 32 * 1024 * 1024,
            etag_checksum_enabled: false,
            encryption: Encryption::None,
            owner: "objfs".to_string(),
            metastore_ttl: None,
        }
    }
}

/// Command-line overrides; every flag wins over its `OBJFS_*` variable.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Disable multi-object delete (overrides OBJFS_MULTI_OBJECT_DELETE)
    #[arg(long)]
    pub no_multi_object_delete: bool,

    /// Keys per bulk delete (overrides OBJFS_MAX_DELETE_BATCH)
    #[arg(long)]
    pub max_delete_batch: Option<usize>,

    /// Keys per LIST page (overrides OBJFS_LIST_PAGE_SIZE)
    #[arg(long)]
    pub list_page_size: Option<usize>,

    /// LIST API version, v1 or v2 (overrides OBJFS_LISTING_VERSION)
    #[arg(long)]
    pub listing_version: Option<String>,

    /// Concurrent store requests (overrides OBJFS_MAX_CONCURRENCY)
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Attempts for transient faults (overrides OBJFS_RETRY_LIMIT)
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Base retry delay in milliseconds (overrides OBJFS_RETRY_INTERVAL_MS)
    #[arg(long)]
    pub retry_interval_ms: Option<u64>,

    /// Trust metastore listings everywhere (overrides OBJFS_AUTHORITATIVE)
    #[arg(long)]
    pub authoritative: bool,

    /// Comma-separated authoritative directories (overrides OBJFS_AUTHORITATIVE_PATHS)
    #[arg(long)]
    pub authoritative_paths: Option<String>,

    /// Block size reported for files (overrides OBJFS_BLOCK_SIZE)
    #[arg(long)]
    pub block_size: Option<u64>,

    /// Expose etags as checksums (overrides OBJFS_ETAG_CHECKSUM_ENABLED)
    #[arg(long)]
    pub etag_checksum: bool,

    /// none, sse-s3 or sse-kms:<key id> (overrides OBJFS_ENCRYPTION)
    #[arg(long)]
    pub encryption: Option<String>,

    /// Owner reported for statuses (overrides OBJFS_OWNER, then USER)
    #[arg(long)]
    pub owner: Option<String>,

    /// Tombstone lifetime in seconds (overrides OBJFS_METASTORE_TTL_SECS)
    #[arg(long)]
    pub metastore_ttl_secs: Option<u64>,
}

/// Parse `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow!("parsing {} value `{}`: {}", name, value, err)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_opt(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_encryption(raw: &str) -> Result<Encryption> {
    Encryption::parse(raw).ok_or_else(|| anyhow!("unknown encryption setting `{}`", raw))
}

fn parse_paths(raw: &str) -> Vec<FsPath> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(FsPath::new)
        .collect()
}

impl FsConfig {
    /// Defaults overlaid with `OBJFS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let owner = match env_opt("OBJFS_OWNER")? {
            Some(owner) => owner,
            None => env::var("USER").unwrap_or(defaults.owner),
        };
        let encryption = match env_opt("OBJFS_ENCRYPTION")? {
            Some(raw) => parse_encryption(&raw)?,
            None => defaults.encryption,
        };
        let authoritative_paths = env_opt("OBJFS_AUTHORITATIVE_PATHS")?
            .map(|raw| parse_paths(&raw))
            .unwrap_or_default();
        let metastore_ttl = env_opt("OBJFS_METASTORE_TTL_SECS")?
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("parsing OBJFS_METASTORE_TTL_SECS value `{}`", raw))
            })
            .transpose()?
            .map(Duration::from_secs);

        Ok(Self {
            multi_object_delete: env_or("OBJFS_MULTI_OBJECT_DELETE", defaults.multi_object_delete)?,
            max_delete_batch: env_or("OBJFS_MAX_DELETE_BATCH", defaults.max_delete_batch)?,
            list_page_size: env_or("OBJFS_LIST_PAGE_SIZE", defaults.list_page_size)?,
            listing_version: env_or("OBJFS_LISTING_VERSION", defaults.listing_version)?,
            max_concurrency: env_or("OBJFS_MAX_CONCURRENCY", defaults.max_concurrency)?,
            retry_limit: env_or("OBJFS_RETRY_LIMIT", defaults.retry_limit)?,
            retry_interval: Duration::from_millis(env_or(
                "OBJFS_RETRY_INTERVAL_MS",
                defaults.retry_interval.as_millis() as u64,
            )?),
            authoritative: env_or("OBJFS_AUTHORITATIVE", defaults.authoritative)?,
            authoritative_paths,
            block_size: env_or("OBJFS_BLOCK_SIZE", defaults.block_size)?,
            etag_checksum_enabled: env_or(
                "OBJFS_ETAG_CHECKSUM_ENABLED",
                defaults.etag_checksum_enabled,
            )?,
            encryption,
            owner,
            metastore_ttl,
        })
    }

    /// Environment configuration with CLI overrides applied on top.
    pub fn from_env_and_args(args: &ConfigArgs) -> Result<Self> {
        let mut cfg = Self::from_env()?;

        if args.no_multi_object_delete {
            cfg.multi_object_delete = false;
        }
        if let Some(n) = args.max_delete_batch {
            cfg.max_delete_batch = n;
        }
        if let Some(n) = args.list_page_size {
            cfg.list_page_size = n;
        }
        if let Some(raw) = &args.listing_version {
            cfg.listing_version = raw.parse()?;
        }
        if let Some(n) = args.max_concurrency {
            cfg.max_concurrency = n;
        }
        if let Some(n) = args.retry_limit {
            cfg.retry_limit = n;
        }
        if let Some(ms) = args.retry_interval_ms {
            cfg.retry_interval = Duration::from_millis(ms);
        }
        if args.authoritative {
            cfg.authoritative = true;
        }
        if let Some(raw) = &args.authoritative_paths {
            cfg.authoritative_paths = parse_paths(raw);
        }
        if let Some(n) = args.block_size {
            cfg.block_size = n;
        }
        if args.etag_checksum {
            cfg.etag_checksum_enabled = true;
        }
        if let Some(raw) = &args.encryption {
            cfg.encryption = parse_encryption(raw)?;
        }
        if let Some(owner) = &args.owner {
            cfg.owner = owner.clone();
        }
        if let Some(secs) = args.metastore_ttl_secs {
            cfg.metastore_ttl = Some(Duration::from_secs(secs));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_delete_batch == 0 {
            return Err(anyhow!("max_delete_batch must be at least 1"));
        }
        if self.list_page_size == 0 {
            return Err(anyhow!("list_page_size must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be at least 1"));
        }
        if self.retry_limit == 0 {
            return Err(anyhow!("retry_limit must be at least 1"));
        }
        Ok(())
    }

    /// Whether metastore listings of `path` may be trusted as complete.
    pub fn is_authoritative_path(&self, path: &FsPath) -> bool {
        self.authoritative
            || self
                .authoritative_paths
                .iter()
                .any(|root| root == path || root.is_ancestor_of(path))
    }
}
