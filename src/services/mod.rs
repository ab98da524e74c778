//! Engines implementing filesystem semantics over an [`ObjectStore`].
//!
//! [`ObjectStore`]: crate::backends::ObjectStore

pub mod context;
pub mod delete;
pub mod executor;
pub mod filesystem;
pub mod invoker;
pub mod listing;
pub mod markers;
pub mod observer;
pub mod rename;
pub mod status;
