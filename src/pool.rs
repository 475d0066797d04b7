//! Offload pool for blocking calls.
//!
//! Broker clients expose blocking APIs. Running them here keeps the
//! cooperative scheduler free for the handlers that are waiting on I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

/// Default number of blocking workers
pub const DEFAULT_OFFLOAD_WORKERS: usize = 10;

/// A bounded pool of blocking worker threads.
///
/// Cloning is cheap; all clones share the same workers and shutdown state.
#[derive(Debug, Clone)]
pub struct OffloadPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    workers: Arc<Semaphore>,
    max_workers: usize,
    shut_down: AtomicBool,
}

impl OffloadPool {
    /// Create a pool running at most `max_workers` blocking calls at once
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                workers: Arc::new(Semaphore::new(max_workers)),
                max_workers,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Run a blocking closure on the pool and await its result.
    ///
    /// Waits for a free worker when all are busy. Fails with
    /// [`Error::PoolShutdown`] once the pool has been shut down.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let worker = self
            .inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolShutdown)?;

        let output = tokio::task::spawn_blocking(move || {
            let _worker = worker;
            f()
        })
        .await?;
        Ok(output)
    }

    /// Stop accepting work. Returns `true` only for the call that shut it down.
    ///
    /// Calls already running finish; queued and future calls fail.
    pub fn shutdown(&self) -> bool {
        let first = !self.inner.shut_down.swap(true, Ordering::SeqCst);
        if first {
            self.inner.workers.close();
            tracing::debug!("offload pool shut down");
        }
        first
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }
}

impl Default for OffloadPool {
    fn default() -> Self {
        Self::new(DEFAULT_OFFLOAD_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_blocking_closure() {
        let pool = OffloadPool::new(2);
        let value = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_worker_count_is_bounded() {
        let pool = OffloadPool::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..6).map(|_| {
            let current = current.clone();
            let peak = peak.clone();
            pool.run(move || {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                current.fetch_sub(1, Ordering::SeqCst);
            })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_rejects_work() {
        let pool = OffloadPool::new(1);
        assert!(pool.shutdown());
        assert!(!pool.shutdown());
        assert!(pool.is_shut_down());

        let err = pool.run(|| ()).await.unwrap_err();
        assert!(matches!(err, Error::PoolShutdown));
    }
}
