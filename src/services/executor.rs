//! Bounded executor owned by one filesystem instance.
//!
//! Every store request holds a permit while in flight, so bulk work fanned
//! out with `buffer_unordered` never exceeds the configured concurrency.
//! Requests race a cancellation token: `interrupt` aborts whatever is in
//! flight, `close` does the same and refuses all later work.

use crate::errors::{FsError, FsResult};
use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
    cancel: Mutex<CancellationToken>,
    closed: AtomicBool,
}

impl BoundedExecutor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            cancel: Mutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> FsResult<()> {
        if self.is_closed() {
            Err(FsError::Closed)
        } else {
            Ok(())
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn acquire(&self, token: &CancellationToken) -> FsResult<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(FsError::Interrupted("waiting for a request slot".to_string())),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| FsError::Closed),
        }
    }

    /// Run one request under a permit. Cancellation drops the request
    /// future, aborting it, and reports `Interrupted`.
    pub async fn run<F>(&self, request: F) -> FsResult<F::Output>
    where
        F: Future,
    {
        self.ensure_open()?;
        let token = self.token();
        let _permit = self.acquire(&token).await?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(FsError::Interrupted("request aborted".to_string())),
            out = request => Ok(out),
        }
    }

    /// Sleep unless interrupted first.
    pub async fn sleep(&self, delay: Duration) -> FsResult<()> {
        let token = self.token();
        tokio::select! {
            _ = token.cancelled() => Err(FsError::Interrupted("retry backoff".to_string())),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Abort every in-flight request. Work started afterwards runs normally.
    pub fn interrupt(&self) {
        let mut cancel = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cancel.cancel();
        *cancel = CancellationToken::new();
        debug!("interrupted in-flight requests");
    }

    /// Abort in-flight requests and refuse new ones. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token().cancel();
        self.permits.close();
        debug!("executor closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn never_exceeds_capacity() {
        use futures::StreamExt;

        let executor = Arc::new(BoundedExecutor::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = futures::stream::iter(0..8)
            .map(|_| {
                let executor = executor.clone();
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    executor
                        .run(async {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                }
            })
            .buffer_unordered(8)
            .collect::<Vec<_>>()
            .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn interrupt_aborts_in_flight_request() {
        let executor = Arc::new(BoundedExecutor::new(1));
        let running = executor.clone();
        let handle = tokio::spawn(async move {
            running
                .run(tokio::time::sleep(Duration::from_secs(30)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.interrupt();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FsError::Interrupted(_))));
        assert!(executor.run(async { 1 }).await.is_ok());
    }

    #[tokio::test]
    async fn closed_executor_refuses_work() {
        let executor = BoundedExecutor::new(1);
        executor.close();
        executor.close();
        assert!(matches!(executor.run(async { 1 }).await, Err(FsError::Closed)));
    }
}
