//! Retry policy for store requests.

use crate::{
    backends::StoreResult,
    errors::{FsError, FsResult},
    models::path::FsPath,
    services::{
        executor::BoundedExecutor,
        observer::{FsObserver, RetryEvent},
    },
};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Runs store requests on the executor, retrying transient faults of
/// idempotent requests with exponential backoff.
#[derive(Clone)]
pub struct Invoker {
    executor: Arc<BoundedExecutor>,
    observer: Arc<dyn FsObserver>,
    retry_limit: u32,
    retry_interval: Duration,
}

impl Invoker {
    pub fn new(
        executor: Arc<BoundedExecutor>,
        observer: Arc<dyn FsObserver>,
        retry_limit: u32,
        retry_interval: Duration,
    ) -> Self {
        Self {
            executor,
            observer,
            retry_limit: retry_limit.max(1),
            retry_interval,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.retry_interval
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Issue `request` until it succeeds, fails permanently, or runs out of
    /// attempts. Faults are translated against `path`.
    pub async fn retry<T, F, Fut>(&self, operation: &str, path: &FsPath, request: F) -> FsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.invoke(operation, path, true, request).await
    }

    /// Issue `request` exactly once.
    pub async fn once<T, F, Fut>(&self, operation: &str, path: &FsPath, request: F) -> FsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.invoke(operation, path, false, request).await
    }

    async fn invoke<T, F, Fut>(
        &self,
        operation: &str,
        path: &FsPath,
        idempotent: bool,
        mut request: F,
    ) -> FsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.executor.run(request()).await? {
                Ok(value) => return Ok(value),
                Err(err) if idempotent && err.is_transient() && attempt < self.retry_limit => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        "{} {} failed on attempt {}: {}; retrying in {:?}",
                        operation, path, attempt, err, delay
                    );
                    self.observer.on_retry(&RetryEvent {
                        operation,
                        path,
                        attempt,
                        delay,
                        error: err.to_string(),
                    });
                    self.executor.sleep(delay).await?;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!("{} {} gave up after {} attempts: {}", operation, path, attempt, err);
                    }
                    return Err(FsError::from_store(operation, path, err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backends::StoreError, services::observer::CountingObserver};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn invoker(observer: Arc<CountingObserver>, limit: u32) -> Invoker {
        Invoker::new(
            Arc::new(BoundedExecutor::new(4)),
            observer,
            limit,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn transient_faults_are_retried() {
        let observer = Arc::new(CountingObserver::default());
        let invoker = invoker(observer.clone(), 5);
        let calls = AtomicU32::new(0);

        let value = invoker
            .retry("head", &FsPath::new("/k"), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Throttled("slow down".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(observer.retries(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient() {
        let invoker = invoker(Arc::new(CountingObserver::default()), 3);
        let calls = AtomicU32::new(0);
        let err = invoker
            .retry("list", &FsPath::new("/k"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Unavailable("down".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Transient { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_and_denied_are_never_retried() {
        let invoker = invoker(Arc::new(CountingObserver::default()), 5);
        let calls = AtomicU32::new(0);
        let err = invoker
            .retry("head", &FsPath::new("/k"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::not_found("k"))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = invoker
            .retry("copy", &FsPath::new("/k"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::AccessDenied("no".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::AccessDenied { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_idempotent_requests_run_once() {
        let invoker = invoker(Arc::new(CountingObserver::default()), 5);
        let calls = AtomicU32::new(0);
        let err = invoker
            .once("put", &FsPath::new("/k"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Throttled("slow down".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Transient { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
