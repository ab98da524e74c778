//! Instrumentation hooks. The engines report events here and never read
//! anything back.

use crate::{errors::FsError, models::outcome::BulkDeleteOutcome, models::path::FsPath};
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

/// A request about to be retried after a transient fault.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    pub operation: &'a str,
    pub path: &'a FsPath,
    /// Attempt that just failed, starting at 1.
    pub attempt: u32,
    pub delay: Duration,
    pub error: String,
}

pub trait FsObserver: Send + Sync {
    fn on_retry(&self, _event: &RetryEvent<'_>) {}

    fn on_bulk_delete_partial_failure(&self, _outcome: &BulkDeleteOutcome) {}

    /// A best-effort step failed and the operation carried on.
    fn on_error_ignored(&self, _operation: &str, _error: &FsError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FsObserver for NoopObserver {}

/// Counts events; handy for embedders exporting their own metrics.
#[derive(Debug, Default)]
pub struct CountingObserver {
    retries: AtomicUsize,
    partial_deletes: AtomicUsize,
    ignored_errors: AtomicUsize,
}

impl CountingObserver {
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn partial_deletes(&self) -> usize {
        self.partial_deletes.load(Ordering::Relaxed)
    }

    pub fn ignored_errors(&self) -> usize {
        self.ignored_errors.load(Ordering::Relaxed)
    }
}

impl FsObserver for CountingObserver {
    fn on_retry(&self, _event: &RetryEvent<'_>) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bulk_delete_partial_failure(&self, _outcome: &BulkDeleteOutcome) {
        self.partial_deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_error_ignored(&self, _operation: &str, _error: &FsError) {
        self.ignored_errors.fetch_add(1, Ordering::Relaxed);
    }
}
