//! Core data models for the filesystem view over an object store.
//!
//! Paths and statuses are what callers see; object records are what the
//! store speaks; metastore records and bulk-delete outcomes sit between.

pub mod file_status;
pub mod metadata;
pub mod object;
pub mod outcome;
pub mod path;
