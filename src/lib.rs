//! objfs: a hierarchical filesystem view over a flat object store.
//!
//! Directories are emulated with zero-byte marker objects (`dir/`), rename
//! and delete are multi-object protocols, and an optional strongly
//! consistent metastore masks the store's eventually consistent listings.
//!
//! The entry point is [`ObjectFileSystem`]; the engines it drives live in
//! [`services`] and can be used on their own through a [`StoreContext`].

pub mod backends;
pub mod config;
pub mod db;
pub mod errors;
pub mod keys;
pub mod metastore;
pub mod models;
pub mod services;

pub use config::FsConfig;
pub use errors::{FsError, FsResult};
pub use models::file_status::{FileStatus, ProbeSet, StatusProbe, Tristate};
pub use models::outcome::BulkDeleteOutcome;
pub use models::path::FsPath;
pub use services::context::StoreContext;
pub use services::filesystem::ObjectFileSystem;
